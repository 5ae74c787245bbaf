pub fn pluralize(value: &str, count: usize) -> String {
    if count == 1 {
        value.to_string()
    } else {
        format!("{value}s")
    }
}

/// Shortens `text` to at most `max_chars` characters, appending `...` when something
/// was cut off.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
