//! Small string helpers shared by the backends, validation and speech.

use std::collections::HashSet;

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn ends_with_terminal_punctuation(text: &str) -> bool {
    matches!(text.trim_end().chars().last(), Some('.' | '!' | '?'))
}

pub fn ensure_terminal_punctuation(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() || ends_with_terminal_punctuation(trimmed) {
        trimmed.to_string()
    } else {
        format!("{}.", trimmed)
    }
}

pub fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_lowercase() => first.to_uppercase().chain(chars).collect(),
        _ => text.to_string(),
    }
}

/// Cuts `text` to at most `max_chars` characters, backing off to the last
/// whitespace so no word is split.
pub fn truncate_at_whitespace(text: &str, max_chars: usize) -> &str {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text;
    };
    let head = &text[..cut];
    match head.rfind(char::is_whitespace) {
        Some(space) if space > 0 => head[..space].trim_end(),
        _ => head,
    }
}

/// Non-empty, trimmed segments between periods.
pub fn sentence_segments(text: &str) -> Vec<&str> {
    text.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn lowercase_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

pub fn char_len(text: &str) -> usize {
    text.trim().chars().count()
}
