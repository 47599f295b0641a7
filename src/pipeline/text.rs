//! Deterministic text cleanup for extracted document text.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Remove invisible code points, collapse whitespace runs to a single
/// space and trim both ends.
///
/// Idempotent: `clean_text(&clean_text(s)) == clean_text(s)`.
pub fn clean_text(input: &str) -> String {
    let s = remove_invisible_chars(input);
    RE_WHITESPACE.replace_all(&s, " ").trim().to_string()
}

// Zero-width space, BOM, soft hyphen, zero-width (non-)joiner, word joiner.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{FEFF}' | '\u{00AD}' | '\u{200C}' | '\u{200D}' | '\u{2060}'
            )
        })
        .collect()
}
