//! Shared utility functions used across multiple modules.

use chrono::{DateTime, Utc};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Convert a stored Unix-millisecond column into a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch rather than failing the row.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Optional variant of [`from_millis`] for nullable columns.
pub fn from_millis_opt(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}

/// Drop sub-millisecond precision so values survive a round trip through storage.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn millis_round_trip_preserves_precision() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(from_millis_opt(None), None);
    }

    #[test]
    fn truncate_to_millis_drops_nanos() {
        let ts = from_millis(1_234) + chrono::Duration::nanoseconds(999_999);
        assert_eq!(truncate_to_millis(ts), from_millis(1_234));
    }
}
