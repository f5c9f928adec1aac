//! Heuristic signal scanners over captured agent output.
//!
//! Each scanner is an independent pure pattern-matcher: absence of a match is
//! `None`, never an error. All matching is case-insensitive over the whole
//! text block.

use crate::JobStatus;
use regex::Regex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt: Option<i64>,
    pub completion: Option<i64>,
    pub total: Option<i64>,
}

/// Scan for `<prompt|completion|total> tokens: N` style counts.
/// The last parseable match per kind wins.
pub fn parse_token_counts(text: &str) -> TokenCounts {
    let pattern =
        Regex::new(r"(?i)(prompt|completion|total)\s*tokens\s*[:=]\s*(\d+)").expect("valid regex");
    let mut counts = TokenCounts::default();
    for caps in pattern.captures_iter(text) {
        if let Ok(value) = caps[2].parse::<i64>() {
            match caps[1].to_lowercase().as_str() {
                "prompt" => counts.prompt = Some(value),
                "completion" => counts.completion = Some(value),
                "total" => counts.total = Some(value),
                _ => {}
            }
        }
    }
    counts
}

/// First `model: <name>` mention in the text.
pub fn detect_model(text: &str) -> Option<String> {
    let pattern = Regex::new(r"(?i)model\s*[:=]\s*([\w\-\.]+)").expect("valid regex");
    pattern
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// First `sub-agent|tool|thread: <name>` mention in the text.
pub fn detect_sub_agent(text: &str) -> Option<String> {
    let pattern =
        Regex::new(r"(?i)(sub-?agent|tool|thread)\s*[:#]\s*([\w\-\.]+)").expect("valid regex");
    pattern
        .captures(text)
        .map(|caps| caps[2].to_string())
}

/// First `[JOB:<id>]` correlation marker; ids are hex-like and at least
/// eight characters.
pub fn extract_job_marker(text: &str) -> Option<String> {
    let pattern = Regex::new(r"(?i)\[JOB:([a-f0-9\-]{8,})\]").expect("valid regex");
    pattern
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Classify a block of output into a job status signal.
///
/// Priority is load-bearing: an error keyword beats an auth phrase beats a
/// completion keyword, so "task done (with errors)" never reads as done.
pub fn classify_status(text: &str) -> Option<JobStatus> {
    let error = Regex::new(r"(?i)\b(error|failed|traceback|exception)\b").expect("valid regex");
    if error.is_match(text) {
        return Some(JobStatus::Error);
    }
    if auth_needed(text) {
        return Some(JobStatus::Blocked);
    }
    let done = Regex::new(r"(?i)\b(done|completed|success|finished)\b").expect("valid regex");
    if done.is_match(text) {
        return Some(JobStatus::Done);
    }
    None
}

/// Does the text look like the agent is stuck on a sign-in or approval gate?
pub fn auth_needed(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("sign in")
        || lowered.contains("log in")
        || lowered.contains("authenticate")
        || lowered.contains("approval")
        || (lowered.contains("openai") && lowered.contains("browser"))
}
