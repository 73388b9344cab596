use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
const BAR_WIDTH: usize = 10;

// Same reserved set as a URL path segment, keeping `/` so folder links nest.
const PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

pub fn human_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn human_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes(bytes_per_sec))
}

pub fn duration(d: Option<Duration>) -> String {
    let Some(d) = d else {
        return "-".to_string();
    };
    let secs = d.as_secs();
    let (days, hours, mins, secs) = (secs / 86400, secs % 86400 / 3600, secs % 3600 / 60, secs % 60);
    match (days, hours, mins) {
        (0, 0, 0) => format!("{secs}s"),
        (0, 0, _) => format!("{mins}m {secs}s"),
        (0, _, _) => format!("{hours}h {mins}m {secs}s"),
        _ => format!("{days}d {hours}h {mins}m"),
    }
}

/// Fixed-width bar for a fraction in `0.0..=1.0`.
pub fn bar(fraction: f64) -> String {
    let filled = ((fraction.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    format!("{}{}", "●".repeat(filled), "○".repeat(BAR_WIDTH - filled))
}

pub fn percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u64
}

/// `index/<quoted name>` with exactly one separator.
pub fn index_url(index: &str, name: &str) -> String {
    format!(
        "{}/{}",
        index.trim_end_matches('/'),
        utf8_percent_encode(name, PATH)
    )
}
