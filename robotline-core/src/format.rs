//! Formatting helpers shared across front ends.

use chrono::{DateTime, Utc};

/// Format a timestamp relative to `now` (e.g., "2m ago").
pub fn format_relative_time_at(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else if duration.num_days() < 7 {
        format!("{}d ago", duration.num_days())
    } else {
        ts.format("%b %d").to_string()
    }
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut = input
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| &input[..idx])
        .unwrap_or(input);
    format!("{}...", cut)
}
