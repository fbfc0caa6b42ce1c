//! Chat formatting sanitizer
//!
//! Server console lines are full of underscores, asterisks and brackets that
//! Discord would render as formatting. Everything that could start a markdown
//! construct gets a backslash; URLs are passed through untouched so they stay
//! clickable.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static MARKDOWN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?P<url><[^: >]+:/[^ >]+>|(?:https?|steam)://[^\s<]+[^<.,:;"'\]\s])|(?P<markdown>[_\\~|*`]|^>(?:>>)?\s|\[.+\]\(.+\)|^#{1,3}|^\s*-#)"#,
    )
    .expect("Failed to compile markdown escape pattern")
});

/// Escape markdown control sequences, leaving links intact
pub fn escape_markdown(text: &str) -> String {
    MARKDOWN_REGEX
        .replace_all(text, |caps: &Captures| {
            if let Some(url) = caps.name("url") {
                return url.as_str().to_string();
            }
            match caps.name("markdown") {
                Some(markdown) => format!("\\{}", markdown.as_str()),
                None => String::new(),
            }
        })
        .into_owned()
}

/// Decode a raw output record, dropping bytes that are not valid UTF-8
pub fn decode_record(record: &[u8]) -> String {
    record.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
