use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    Determinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminateProgress {
    pub mode: ProgressMode,
    pub label: String,
    pub processed: usize,
    pub total: usize,
    /// `processed / total`, in `[0, 1]`.
    pub value: f64,
}

/// Progress update pushed to a UI layer.
///
/// Serializes as a bare integer percentage or as
/// `{"mode":"determinate","label":..,"processed":..,"total":..,"value":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Percent(u8),
    Determinate(DeterminateProgress),
}

impl ProgressEvent {
    /// Rounded percentage of `completed` out of `total` (an empty total counts as 1).
    pub fn percent(completed: usize, total: usize) -> Self {
        let total = total.max(1);
        let pct = ((completed as f64 / total as f64) * 100.0).round();
        ProgressEvent::Percent(pct.clamp(0.0, 100.0) as u8)
    }

    pub fn determinate(label: impl Into<String>, processed: usize, total: usize) -> Self {
        let value = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64).clamp(0.0, 1.0)
        };
        ProgressEvent::Determinate(DeterminateProgress {
            mode: ProgressMode::Determinate,
            label: label.into(),
            processed,
            total,
            value,
        })
    }

    /// Percentage view of either shape.
    pub fn as_percent(&self) -> u8 {
        match self {
            ProgressEvent::Percent(pct) => *pct,
            ProgressEvent::Determinate(d) => (d.value * 100.0).round() as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn percent_rounds_and_guards_empty_total() {
        assert_eq!(ProgressEvent::percent(1, 3), ProgressEvent::Percent(33));
        assert_eq!(ProgressEvent::percent(2, 3), ProgressEvent::Percent(67));
        assert_eq!(ProgressEvent::percent(0, 0), ProgressEvent::Percent(0));
    }

    #[test]
    fn wire_shapes_match_ui_contract() {
        let pct = serde_json::to_value(ProgressEvent::Percent(40)).unwrap();
        assert_eq!(pct, json!(40));

        let det = serde_json::to_value(ProgressEvent::determinate("Deleting", 1, 4)).unwrap();
        assert_eq!(
            det,
            json!({
                "mode": "determinate",
                "label": "Deleting",
                "processed": 1,
                "total": 4,
                "value": 0.25
            })
        );
    }
}
