//! Small helpers shared by config parsing, the HTTP client and the clock.

/// Longest server message kept in an error
pub const ERROR_EXCERPT_CHARS: usize = 180;

/// Trimmed value, or `None` when missing or blank
pub fn trimmed_non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Whether `value` names an `http` or `https` endpoint (scheme is case-insensitive)
pub fn has_http_scheme(value: &str) -> bool {
    let Some((scheme, rest)) = value.split_once("://") else {
        return false;
    };
    !rest.is_empty()
        && (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
}

/// First [`ERROR_EXCERPT_CHARS`] characters of a trimmed server message
pub fn error_excerpt(value: &str) -> String {
    value.trim().chars().take(ERROR_EXCERPT_CHARS).collect()
}

pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whole milliseconds, saturating at `i64::MAX`
pub fn duration_millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
