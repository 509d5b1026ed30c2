/// Whether an error message carries a quota-exhaustion signal.
///
/// Backends phrase rate-limit failures as free text, so this is a deliberate
/// substring heuristic, kept in one place so a structured error code from a
/// richer backend contract can replace it without touching scheduling logic.
/// Matches are case-insensitive.
pub fn is_quota_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("quota")
        || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_signals_are_recognized() {
        assert!(is_quota_error("HTTP 429 returned by upstream"));
        assert!(is_quota_error("Rate Limit exceeded, slow down"));
        assert!(is_quota_error("monthly QUOTA exhausted"));
        assert!(is_quota_error("Too Many Requests"));
    }

    #[test]
    fn plain_failures_are_not_quota_signals() {
        assert!(!is_quota_error("connection refused"));
        assert!(!is_quota_error("500 Internal Server Error"));
        assert!(!is_quota_error(""));
    }
}
