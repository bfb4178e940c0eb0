use crate::bounded_string::BoundedString;

const FILTER_ASCII_START: u8 = 0x21;
const FILTER_ASCII_END: u8 = 0x7E;
const FILTER_ASCII_TAB: u8 = 0x09;
const FILTER_ASCII_NEWLINE: u8 = 0x0A;
const FILTER_ASCII_SPACE: u8 = 0x20;

/// Which characters beyond printable ASCII a sanitisation pass allows through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SanitizeMode {
    /// Printable ASCII only. Used for usernames.
    Strict,
    /// Printable ASCII plus TAB, LF and SPACE. Used for chat text and
    /// server notices.
    Permissive,
}

/// Filters `input` down to the allowed character set for `mode`, appending a
/// trailing NUL if the result doesn't already end in one.
///
/// Returns `None` iff the filtered output is empty — callers treat this as a
/// rejection (empty username, empty message after stripping disallowed bytes).
pub fn sanitize(input: &[u8], mode: SanitizeMode) -> Option<BoundedString> {
    let mut filtered = Vec::with_capacity(input.len());
    for &byte in input {
        let allowed = (FILTER_ASCII_START..=FILTER_ASCII_END).contains(&byte)
            || (mode == SanitizeMode::Permissive
                && matches!(byte, FILTER_ASCII_TAB | FILTER_ASCII_NEWLINE | FILTER_ASCII_SPACE));
        if allowed {
            filtered.push(byte);
        }
    }
    if filtered.last() != Some(&0) {
        filtered.push(0);
    }
    if filtered.len() <= 1 {
        return None;
    }
    BoundedString::from_slice(&filtered).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_drops_space_and_control() {
        let out = sanitize(b"al i\t\n", SanitizeMode::Strict).unwrap();
        assert_eq!(out.as_bytes(), b"al\0");
    }

    #[test]
    fn permissive_keeps_tab_newline_space() {
        let out = sanitize(b"hi\tthere\n", SanitizeMode::Permissive).unwrap();
        assert_eq!(out.as_bytes(), b"hi\tthere\n\0");
    }

    #[test]
    fn empty_after_filtering_is_rejected() {
        assert!(sanitize(b"\x01\x02", SanitizeMode::Strict).is_none());
        assert!(sanitize(b"", SanitizeMode::Strict).is_none());
    }

    #[test]
    fn idempotent_on_already_sanitised_input() {
        let once = sanitize(b"ali", SanitizeMode::Strict).unwrap();
        let twice = sanitize(once.as_bytes(), SanitizeMode::Strict).unwrap();
        assert_eq!(once.as_bytes(), twice.as_bytes());
    }
}
