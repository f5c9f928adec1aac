//! Normalization of raw events into the canonical schema, plus the shared
//! enrichment pass that mines output text for signals.

use crate::signal::{self, TokenCounts};
use crate::tokens::estimate_tokens;
use crate::StatusEvent;
use sha2::{Digest, Sha256};

/// Prompts longer than this many characters are stored as hash only.
pub const PROMPT_TEXT_LIMIT: usize = 10_000;

/// Normalize prompt fields in place.
///
/// Non-empty prompt text is hashed into `prompt_hash`; bodies over
/// [`PROMPT_TEXT_LIMIT`] are dropped so the hash stays the identity key
/// without the row carrying the full text. `prompt_bytes` is derived from the
/// original text (before any truncation) when the caller did not supply it.
/// Everything else passes through untouched. Idempotent.
pub fn normalize_event(event: &mut StatusEvent) {
    let prompt = event.prompt_text.clone().unwrap_or_default();
    if !prompt.is_empty() {
        event.prompt_hash = Some(sha256_hex(prompt.as_bytes()));
        if prompt.chars().count() > PROMPT_TEXT_LIMIT {
            event.prompt_text = None;
        }
    }
    if event.prompt_bytes.is_none() {
        event.prompt_bytes = Some(prompt.len() as i64);
    }
}

/// Mine an output-bearing event's `text` for semantic signals.
///
/// Fills job id (correlation marker, only when none is present), exact token
/// counts, model, status, token estimates, and sub-agent. Must run before the
/// reconciler so the discovered job id and status are visible to it.
pub fn enrich_event(event: &mut StatusEvent) {
    let text = event.text().to_string();

    if event.job_id().is_none() && !text.is_empty() {
        event.job_id = signal::extract_job_marker(&text);
    }

    let TokenCounts {
        prompt,
        completion,
        total,
    } = signal::parse_token_counts(&text);
    if prompt.is_some() {
        event.prompt_tokens_exact = prompt;
    }
    if completion.is_some() {
        event.completion_tokens_exact = completion;
    }
    if total.is_some() {
        event.total_tokens_exact = total;
    }

    if event.model.as_deref().map_or(true, str::is_empty) {
        event.model = signal::detect_model(&text);
    }
    if let Some(status) = signal::classify_status(&text) {
        event.status = Some(status);
    }

    if let Some(prompt_text) = event.prompt_text.as_deref().filter(|p| !p.is_empty()) {
        event.prompt_tokens_est = Some(estimate_tokens(prompt_text) as i64);
    }
    if !text.is_empty() {
        let completion_est = estimate_tokens(&text) as i64;
        event.completion_tokens_est = Some(completion_est);
        if let Some(prompt_est) = event.prompt_tokens_est {
            event.total_tokens_est = Some(prompt_est + completion_est);
        }
    }

    if let Some(sub_agent) = signal::detect_sub_agent(&text) {
        event.sub_agent = Some(sub_agent);
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
