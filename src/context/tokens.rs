//! Token estimation

/// Approximate characters per token for English text
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`: one token per started group of four
/// characters, zero for empty text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// Longest prefix of `text` whose estimate fits in `max_tokens`
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens.saturating_mul(APPROX_CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
