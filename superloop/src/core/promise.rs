//! Completion promise extraction.

use std::sync::LazyLock;

use regex::Regex;

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<promise>(.*?)</promise>").expect("promise regex"));

/// Collapse whitespace runs to a single space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the last `<promise>...</promise>` token from a message.
pub fn extract_promise(message: &str) -> Option<String> {
    PROMISE_RE
        .captures_iter(message)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_whitespace(m.as_str()))
}

/// True when the message carries a promise equal to `expected` after normalization.
pub fn promise_matches(message: Option<&str>, expected: &str) -> bool {
    let expected = normalize_whitespace(expected);
    if expected.is_empty() {
        return false;
    }
    message
        .and_then(extract_promise)
        .is_some_and(|found| found == expected)
}
