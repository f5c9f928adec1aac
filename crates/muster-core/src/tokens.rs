/// Deterministic token estimate for arbitrary text.
///
/// No precise tokenizer ships with this stack, so the estimate is the usual
/// four-bytes-per-token rule of thumb, rounded up. Empty text is zero tokens.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as u64).div_ceil(4)
}
