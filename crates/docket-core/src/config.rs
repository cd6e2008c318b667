//! Environment parsing shared by the worker and the binary.

/// Parse a boolean flag value.
///
/// Recognizes "true", "1", "yes", "on" and "false", "0", "no", "off"
/// (case-insensitive, surrounding whitespace ignored).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a boolean environment variable, falling back to `default` when it is
/// missing or unrecognized.
pub fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|val| parse_bool(&val))
        .unwrap_or(default)
}
