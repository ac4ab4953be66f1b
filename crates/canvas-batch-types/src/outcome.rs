use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::RequestId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord<R> {
    pub id: RequestId,
    pub value: R,
}

/// Terminal failure of a request. `status` is 0 when no HTTP status was available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: RequestId,
    pub status: u16,
    pub reason: String,
}

/// Aggregate outcome of one batch run.
///
/// Both vectors are in completion order. `cancelled` is set when the run
/// stopped admitting work before the input was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<R> {
    pub successful: Vec<SuccessRecord<R>>,
    pub failed: Vec<FailureRecord>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub successful: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl<R> BatchResult<R> {
    pub fn empty() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        }
    }

    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            successful: self.successful.len(),
            failed: self.failed.len(),
            cancelled: self.cancelled,
        }
    }

    /// Re-sorts both outcome lists into id order.
    pub fn sorted_by_id(mut self) -> Self {
        self.successful.sort_by(|a, b| a.id.cmp(&b.id));
        self.failed.sort_by(|a, b| a.id.cmp(&b.id));
        self
    }

    /// Sorts `expected` into succeeded / explicitly failed / unaccounted-for.
    ///
    /// Order within each bucket follows `expected`. Duplicate expected ids are
    /// reported once.
    pub fn reconcile<I>(&self, expected: I) -> Reconciliation
    where
        I: IntoIterator<Item = RequestId>,
    {
        let ok: HashSet<&RequestId> = self.successful.iter().map(|s| &s.id).collect();
        let failed: HashSet<&RequestId> = self.failed.iter().map(|f| &f.id).collect();
        let mut seen = HashSet::new();
        let mut out = Reconciliation::default();

        for id in expected {
            if !seen.insert(id.clone()) {
                continue;
            }
            if ok.contains(&id) {
                out.succeeded.push(id);
            } else if failed.contains(&id) {
                out.failed.push(id);
            } else {
                out.unaccounted.push(id);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub succeeded: Vec<RequestId>,
    pub failed: Vec<RequestId>,
    pub unaccounted: Vec<RequestId>,
}

impl Reconciliation {
    pub fn is_complete(&self) -> bool {
        self.unaccounted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> BatchResult<u32> {
        BatchResult {
            successful: vec![
                SuccessRecord {
                    id: "3".into(),
                    value: 30,
                },
                SuccessRecord {
                    id: "1".into(),
                    value: 10,
                },
            ],
            failed: vec![FailureRecord {
                id: "2".into(),
                status: 404,
                reason: "Not Found".to_string(),
            }],
            cancelled: false,
        }
    }

    #[test]
    fn reconcile_finds_unaccounted_ids() {
        let expected = ["1", "2", "3", "4", "4"].map(RequestId::from);
        let rec = result().reconcile(expected);
        assert_eq!(rec.succeeded, vec![RequestId::from("1"), RequestId::from("3")]);
        assert_eq!(rec.failed, vec![RequestId::from("2")]);
        assert_eq!(rec.unaccounted, vec![RequestId::from("4")]);
        assert!(!rec.is_complete());
    }

    #[test]
    fn sorted_by_id_restores_input_order() {
        let sorted = result().sorted_by_id();
        let ids: Vec<&str> = sorted.successful.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn summary_counts_outcomes() {
        let summary = result().summary();
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.cancelled);
        assert_eq!(BatchResult::<()>::empty().total(), 0);
    }
}
