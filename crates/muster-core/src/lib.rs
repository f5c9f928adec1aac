use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod normalize;
pub mod signal;
pub mod tokens;

/// Fixed roster of observed agents.
pub const AGENT_ROSTER: [&str; 4] = ["fast", "deep", "test", "sec"];

pub const KIND_DISPATCH: &str = "dispatch";
pub const KIND_PANE_OUTPUT: &str = "pane_output";
pub const KIND_CONTROLLER_OUTPUT: &str = "controller_output";

/// Event kinds that carry captured output text.
pub fn is_output_kind(kind: &str) -> bool {
    matches!(kind, KIND_PANE_OUTPUT | KIND_CONTROLLER_OUTPUT)
}

/// One unit of observed activity, from either the event log or a pane capture.
///
/// The same struct serves as the raw wire shape (every field optional, unknown
/// keys preserved in `extra`) and as the normalized/enriched record that gets
/// persisted and broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusEvent {
    pub ts: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub session: Option<String>,
    pub agent: Option<String>,
    pub pane_id: Option<String>,
    pub window_name: Option<String>,
    pub job_id: Option<String>,
    pub text: Option<String>,
    pub prompt_text: Option<String>,
    pub prompt_hash: Option<String>,
    pub prompt_bytes: Option<i64>,
    pub output_path: Option<String>,
    pub output_bytes: Option<i64>,
    pub model: Option<String>,
    pub sub_agent: Option<String>,
    pub status: Option<JobStatus>,
    pub prompt_tokens_exact: Option<i64>,
    pub completion_tokens_exact: Option<i64>,
    pub total_tokens_exact: Option<i64>,
    pub prompt_tokens_est: Option<i64>,
    pub completion_tokens_est: Option<i64>,
    pub total_tokens_est: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StatusEvent {
    /// Job id with empty strings treated as absent.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Agent name with empty strings treated as absent.
    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref().filter(|name| !name.is_empty())
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Done,
    Error,
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Blocked => "blocked",
        }
    }

    /// Final states: once reached, the job's duration is locked in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Blocked)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            "blocked" => Ok(JobStatus::Blocked),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}
