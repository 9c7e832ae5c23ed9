//! Parsing of free-form generation output
//!
//! Generation backends wrap JSON in markdown fences or surround it with
//! prose. Every call site goes through one of these functions and gets an
//! `Option` back; `None` means "skip this unit of work".

use serde::de::DeserializeOwned;

/// Remove a surrounding markdown code fence, if any
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let fence = match regex::Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```$") {
        Ok(re) => re,
        Err(_) => return trimmed.to_string(),
    };
    match fence.captures(trimmed).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => trimmed.to_string(),
    }
}

/// Parse the JSON object contained in a response.
///
/// Tries the fence-stripped text first, then the span from the first `{`
/// to the last `}`.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    let body = strip_fences(text);
    if let Ok(value) = serde_json::from_str::<T>(&body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<T>(&body[start..=end]).ok()
}

/// Normalize a one-line answer: trim, strip quote marks
pub fn clean_line(text: &str) -> String {
    const QUOTES: &[char] = &['"', '\'', '`', '「', '」', '“', '”', '‘', '’'];
    text.trim().trim_matches(QUOTES).trim().to_string()
}

/// Truncate to at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
