//! ANSI/control-sequence stripping for terminal buffer captures

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences (cursor movement, colors, erase)
static CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// OSC sequences (window title etc.), terminated by BEL or ST
static OSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Two-byte escapes and stray ESC
static ESC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[@-Z\\-_]?").unwrap());

/// Strip escape sequences and non-printing control bytes, keeping newlines
/// and tabs so line structure survives.
pub fn strip_ansi(input: &str) -> String {
    let stripped = CSI.replace_all(input, "");
    let stripped = OSC.replace_all(&stripped, "");
    let stripped = ESC.replace_all(&stripped, "");
    stripped
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_color_codes() {
        assert_eq!(strip_ansi("\x1b[1;32mhello\x1b[0m world"), "hello world");
    }

    #[test]
    fn test_strips_cursor_and_erase() {
        assert_eq!(strip_ansi("\x1b[2J\x1b[H> prompt\x1b[K"), "> prompt");
    }

    #[test]
    fn test_strips_osc_title() {
        assert_eq!(strip_ansi("\x1b]0;my-title\x07line"), "line");
    }

    #[test]
    fn test_keeps_newlines_drops_carriage_returns() {
        assert_eq!(strip_ansi("a\r\nb\rc"), "a\nbc");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }
}
