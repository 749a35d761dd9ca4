//! Small shared helpers for the orchestrator core.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Append `addition` to `buffer`, separating with a single space when both
/// sides are non-empty.
pub(crate) fn append_text(buffer: &mut String, addition: &str) {
    let addition = addition.trim();
    if addition.is_empty() {
        return;
    }
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(addition);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_text_inserts_separator() {
        let mut buffer = String::from("hello");
        append_text(&mut buffer, "world");
        assert_eq!(buffer, "hello world");
    }

    #[test]
    fn append_text_skips_empty_additions() {
        let mut buffer = String::new();
        append_text(&mut buffer, "   ");
        assert!(buffer.is_empty());
        append_text(&mut buffer, " first ");
        assert_eq!(buffer, "first");
    }
}
