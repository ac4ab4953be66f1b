use std::collections::BTreeMap;
use std::time::Duration;

use canvas_batch_types::RequestError;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

/// Statuses worth retrying regardless of the message body.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

static THROTTLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)throttl|rate.?limit|too many|try again later|exceed")
        .expect("valid throttle regex")
});

/// Client-independent view of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorShape {
    /// 0 when the failure carried no HTTP status.
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub message: String,
}

/// The single adapter between request errors and retry policy.
pub fn classify_error(err: &RequestError) -> ErrorShape {
    let message = if !err.errors.is_empty() {
        err.errors
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    } else {
        err.message.trim().to_string()
    };
    let message = if message.is_empty() {
        "Unknown error".to_string()
    } else {
        message
    };
    let headers = err
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    ErrorShape {
        status: err.status.unwrap_or(0),
        headers,
        message,
    }
}

impl ErrorShape {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_throttled(&self) -> bool {
        THROTTLE_RE.is_match(&self.message)
            || self.header("x-rate-limit-remaining") == Some("0")
            || self.headers.contains_key("retry-after")
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_STATUSES.contains(&self.status)
            || self.status == 0
            || (self.status == 403 && self.is_throttled())
    }

    /// Server-supplied delay. Only delta-seconds are understood; HTTP-date
    /// values and non-positive numbers yield `None`.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.header("retry-after")?;
        let secs: f64 = raw.parse().ok()?;
        if !secs.is_finite() || secs <= 0.0 {
            return None;
        }
        Some(Duration::from_millis((secs * 1000.0).round() as u64))
    }
}

/// Delay before retry number `attempt + 1`, jitter excluded.
pub fn backoff_delay(shape: &ErrorShape, attempt: u32, base_delay_ms: u64) -> Duration {
    if let Some(hint) = shape.retry_after() {
        return hint;
    }
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_delay_ms.saturating_mul(factor))
}

/// Uniform jitter in `[0, jitter_ms)`.
pub fn jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_structured_errors_into_message() {
        let err = RequestError::http(400, "Bad Request").with_errors([" a ", "", "b"]);
        assert_eq!(classify_error(&err).message, "a; b");
        assert_eq!(classify_error(&RequestError::default()).message, "Unknown error");
    }

    #[test]
    fn status_classes() {
        for status in RETRYABLE_STATUSES {
            assert!(classify_error(&RequestError::http(status, "x")).is_retryable());
        }
        assert!(classify_error(&RequestError::network("connection reset")).is_retryable());
        assert!(!classify_error(&RequestError::http(404, "Not Found")).is_retryable());
        assert!(!classify_error(&RequestError::http(401, "Unauthorized")).is_retryable());
    }

    #[test]
    fn forbidden_is_retryable_only_when_throttled() {
        let plain = RequestError::http(403, "user not authorized to perform that action");
        assert!(!classify_error(&plain).is_retryable());

        let by_message = RequestError::http(403, "403 Forbidden (Rate Limit Exceeded)");
        assert!(classify_error(&by_message).is_retryable());

        let by_remaining =
            RequestError::http(403, "Forbidden").with_header("X-Rate-Limit-Remaining", "0");
        assert!(classify_error(&by_remaining).is_retryable());

        let by_retry_after = RequestError::http(403, "Forbidden").with_header("Retry-After", "5");
        assert!(classify_error(&by_retry_after).is_retryable());

        let remaining_left =
            RequestError::http(403, "Forbidden").with_header("x-rate-limit-remaining", "12.5");
        assert!(!classify_error(&remaining_left).is_retryable());
    }

    #[test]
    fn throttle_pattern_variants() {
        for msg in [
            "Throttled",
            "ratelimit hit",
            "rate-limit",
            "Too Many Requests",
            "please try again later",
            "quota exceeded",
        ] {
            let shape = classify_error(&RequestError::http(403, msg));
            assert!(shape.is_throttled(), "{msg} should look throttled");
        }
    }

    #[test]
    fn retry_after_seconds_override_exponential_backoff() {
        let shape = classify_error(&RequestError::http(429, "slow").with_header("retry-after", "2"));
        assert_eq!(backoff_delay(&shape, 0, 200), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&shape, 3, 200), Duration::from_millis(2000));

        let fractional =
            classify_error(&RequestError::http(429, "slow").with_header("retry-after", "0.5"));
        assert_eq!(backoff_delay(&fractional, 0, 200), Duration::from_millis(500));
    }

    #[test]
    fn unusable_retry_after_falls_back_to_exponential() {
        for raw in ["0", "-1", "NaN", "inf", "Wed, 21 Oct 2015 07:28:00 GMT"] {
            let shape =
                classify_error(&RequestError::http(503, "down").with_header("retry-after", raw));
            assert_eq!(shape.retry_after(), None, "{raw}");
            assert_eq!(backoff_delay(&shape, 2, 200), Duration::from_millis(800));
        }
        let shape = classify_error(&RequestError::http(503, "down"));
        assert_eq!(backoff_delay(&shape, 0, 200), Duration::from_millis(200));
        assert_eq!(backoff_delay(&shape, 1, 200), Duration::from_millis(400));
        assert_eq!(backoff_delay(&shape, 200, 200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn jitter_stays_in_range() {
        assert_eq!(jitter(0), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(50) < Duration::from_millis(50));
        }
    }
}
