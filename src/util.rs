//! Shared utility functions for the delve crate.

use chrono::{DateTime, Utc};

/// Compact UTC timestamp used in run folders and document filenames,
/// e.g. `20250131T074501Z`.
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Human-readable UTC timestamp used inside generated documents.
pub fn display_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%SZ").to_string()
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Interpret common truthy spellings used in environment variables.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
