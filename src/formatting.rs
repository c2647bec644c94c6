//! Terminal formatting for CLI output
//!
//! Repo hyperlinks, compact counts, signed deltas and relative ages.

use chrono::{DateTime, Utc};

/// Format repo name as clickable hyperlink (only if stdout is a TTY)
pub fn format_repo_link(full_name: &str) -> String {
    use std::io::IsTerminal;
    if std::io::stdout().is_terminal() {
        // OSC 8 hyperlink: \x1b]8;;URL\x1b\\TEXT\x1b]8;;\x1b\\
        format!(
            "\x1b]8;;https://github.com/{}\x1b\\\x1b[1m{}\x1b[0m\x1b]8;;\x1b\\",
            full_name, full_name
        )
    } else {
        full_name.to_string()
    }
}

/// Compact counter (e.g. 999, 1.2k, 15k, 3.4M)
pub fn format_count(n: u64) -> String {
    match n {
        0..=999 => n.to_string(),
        1_000..=9_999 => format!("{:.1}k", n as f64 / 1_000.0),
        10_000..=999_999 => format!("{}k", n / 1_000),
        _ => format!("{:.1}M", n as f64 / 1_000_000.0),
    }
}

/// Change between two observations, signed
pub fn format_delta(current: u64, previous: u64) -> String {
    let delta = current as i64 - previous as i64;
    match delta {
        0 => "=".to_string(),
        d if d > 0 => format!("+{}", d),
        d => d.to_string(),
    }
}

/// Relative age ("just now", "5m ago", "3h ago", "2d ago")
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m ago", mins);
    }
    let hours = mins / 60;
    if hours < 48 {
        return format!("{}h ago", hours);
    }
    format!("{}d ago", hours / 24)
}

/// Truncate string safely at char boundary
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
