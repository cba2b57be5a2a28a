//! Whitespace-column parsing of platform tool output.
//!
//! Tool output (`top`, `nettop`, `/proc/net` counter dumps) is line-oriented
//! and whitespace-delimited, but column counts vary by OS version. Parsing is
//! deliberately permissive: callers declare the columns they care about and
//! treat absent keys as a recoverable condition.

use std::collections::HashMap;

/// Split a trimmed line on runs of whitespace and map tokens onto declared
/// column names.
///
/// The i-th token is assigned to the i-th column name; positions declared as
/// `None` are skipped. Cardinality is not validated: if the line has fewer
/// tokens than columns, trailing columns are simply absent from the result;
/// tokens beyond the declared columns are discarded.
pub fn split_columns<'l, 'c>(
    line: &'l str,
    columns: &[Option<&'c str>],
) -> HashMap<&'c str, &'l str> {
    let mut out = HashMap::with_capacity(columns.len());

    for (token, column) in line.trim().split_whitespace().zip(columns.iter()) {
        if let Some(name) = column {
            out.insert(*name, token);
        }
    }

    out
}

/// Parse a byte size like `"12M"`, `"3.4G"` or `"512"` into a byte count.
///
/// Uses binary multipliers (K=1024, M=1024², G=1024³). A bare number is taken
/// as-is; empty or unparsable input yields 0.
pub fn parse_bytes(raw: &str) -> u64 {
    let s = raw.trim();
    if s.is_empty() {
        return 0;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());

    let num: f64 = match s[..split].parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };

    let multiplier = match s[split..].trim_start().chars().next() {
        Some('K') => 1024.0,
        Some('M') => 1024.0 * 1024.0,
        Some('G') => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    (num * multiplier) as u64
}

/// Format a byte count with binary units, keeping at most one decimal place.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

    if bytes <= 0.0 {
        return "0 Bytes".to_string();
    }

    let exp = ((bytes.ln() / 1024f64.ln()).floor() as usize).min(UNITS.len() - 1);
    let value = bytes / 1024f64.powi(exp as i32);

    let rendered = format!("{value:.1}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');

    format!("{rendered} {}", UNITS[exp])
}

/// Format a millisecond duration as `HH:MM:SS.d` (tenths of a second).
pub fn format_duration(millis: u64) -> String {
    let tenths = (millis % 1000) / 100;
    let seconds = (millis / 1000) % 60;
    let minutes = (millis / 60_000) % 60;
    let hours = (millis / 3_600_000) % 24;

    format!("{hours:02}:{minutes:02}:{seconds:02}.{tenths}")
}
