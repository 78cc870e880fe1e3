//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
///
/// Used for origin lists such as `FRONTEND_ORIGINS`.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        assert!(now_unix_secs() > 1_577_836_800);
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(
            split_list(" http://a:5173, ,http://b:3000,"),
            vec!["http://a:5173".to_string(), "http://b:3000".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
