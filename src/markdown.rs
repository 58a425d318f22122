//! Discord markdown helpers.

use chrono::Duration;

/// Characters Discord interprets as formatting.
const SPECIAL: &[char] = &['\\', '_', '*', '`', '>', '~', '|'];

/// Escape user-provided text (runner names, stream titles) so it renders
/// literally. Never call this on URLs: Discord would keep the backslashes
/// and the link would break.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `H:MM:SS`, hours unbounded. Negative durations render as zero.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_formatting_characters() {
        assert_eq!(escape_markdown("foo_title"), "foo\\_title");
        assert_eq!(escape_markdown("*bold* `code`"), "\\*bold\\* \\`code\\`");
        assert_eq!(escape_markdown("> quote"), "\\> quote");
        assert_eq!(escape_markdown("a\\b"), "a\\\\b");
        assert_eq!(escape_markdown("~~x~~ ||y||"), "\\~\\~x\\~\\~ \\|\\|y\\|\\|");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(escape_markdown("Any% NMS [WR pace]"), "Any% NMS [WR pace]");
        assert_eq!(escape_markdown(""), "");
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::seconds(0)), "0:00:00");
        assert_eq!(format_duration(Duration::seconds(59)), "0:00:59");
        assert_eq!(format_duration(Duration::seconds(3 * 3600 + 7 * 60 + 5)), "3:07:05");
        assert_eq!(format_duration(Duration::hours(27)), "27:00:00");
        assert_eq!(format_duration(Duration::seconds(-5)), "0:00:00");
    }
}
