//! Output file naming.
//!
//! Timestamps are rendered in the caller's zone; the workflow passes local
//! time so filenames match the broadcaster's calendar.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, collapsing runs.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sub = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "recording".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn raw_capture_name<Tz: TimeZone>(stream_name: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{}_{}_raw.mp3", sanitize(stream_name), at.format("%Y%m%d_%H%M%S"))
}

/// Expand `{date}`, `{name}` and `{timestamp}` in a filename pattern.
pub fn render_pattern<Tz: TimeZone>(pattern: &str, stream_name: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    let rendered = pattern
        .replace("{date}", &at.format("%Y-%m-%d").to_string())
        .replace("{timestamp}", &at.format("%Y%m%d_%H%M%S").to_string())
        .replace("{name}", &sanitize(stream_name));
    // patterns must not escape the recordings directory
    rendered.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn mountain() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(6 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 7, 4, 18, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Morning Show!"), "Morning_Show");
        assert_eq!(sanitize("  a  b  "), "a_b");
        assert_eq!(sanitize("///"), "recording");
        assert_eq!(sanitize("kexp-90.3"), "kexp-90.3");
    }

    #[test]
    fn test_raw_name_uses_local_timestamp() {
        assert_eq!(
            raw_capture_name("Night Owl", &mountain()),
            "Night_Owl_20240704_183005_raw.mp3"
        );
    }

    #[test]
    fn test_render_default_pattern() {
        assert_eq!(
            render_pattern("{date}_{name}.mp3", "Night Owl", &mountain()),
            "2024-07-04_Night_Owl.mp3"
        );
        assert_eq!(
            render_pattern("{name}/{timestamp}.mp3", "x", &mountain()),
            "x_20240704_183005.mp3"
        );
    }
}
