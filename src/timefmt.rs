//! Letter-based timestamp patterns for output file names.
//!
//! Patterns use single letters in the PHP `date()` style, so `YmdHis`
//! renders as `20240101120530`. Letters without a meaning are copied through.

use chrono::{DateTime, Datelike, TimeZone, Timelike};

/// Render `time` according to `pattern`.
///
/// | Letter | Meaning                      |
/// |--------|------------------------------|
/// | `Y`    | four-digit year              |
/// | `y`    | two-digit year               |
/// | `m`    | month, zero padded           |
/// | `n`    | month                        |
/// | `d`    | day of month, zero padded    |
/// | `H`    | hour (24h), zero padded      |
/// | `G`    | hour (24h)                   |
/// | `i`    | minutes, zero padded         |
/// | `s`    | seconds, zero padded         |
/// | `I`    | milliseconds, three digits   |
/// | `U`    | seconds since the Unix epoch |
pub fn format_timestamp<Tz: TimeZone>(time: &DateTime<Tz>, pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            'Y' => out.push_str(&time.year().to_string()),
            'y' => out.push_str(&format!("{:02}", time.year().rem_euclid(100))),
            'm' => out.push_str(&format!("{:02}", time.month())),
            'n' => out.push_str(&time.month().to_string()),
            'd' => out.push_str(&format!("{:02}", time.day())),
            'H' => out.push_str(&format!("{:02}", time.hour())),
            'G' => out.push_str(&time.hour().to_string()),
            'i' => out.push_str(&format!("{:02}", time.minute())),
            's' => out.push_str(&format!("{:02}", time.second())),
            'I' => out.push_str(&format!("{:03}", time.timestamp_subsec_millis().min(999))),
            'U' => out.push_str(&time.timestamp().to_string()),
            other => out.push(other),
        }
    }
    out
}
