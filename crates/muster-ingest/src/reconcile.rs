//! Folds enriched events into durable job and agent rows.

use muster_core::normalize::{enrich_event, normalize_event};
use muster_core::{is_output_kind, JobStatus, StatusEvent, KIND_DISPATCH};
use muster_storage::{AgentRecord, JobRecord, StatusStore, StorageError};

/// Status the reconciler acts on for this event. An explicit status on the
/// event wins; otherwise dispatch and output events imply the job is running.
pub fn effective_status(event: &StatusEvent) -> Option<JobStatus> {
    if let Some(status) = event.status {
        return Some(status);
    }
    if event.kind == KIND_DISPATCH || is_output_kind(&event.kind) {
        return Some(JobStatus::Running);
    }
    None
}

/// Fold one enriched event into its job and agent rows.
///
/// Events without a job id touch neither table; the caller still records and
/// re-emits them. `started_ts` is only ever supplied by dispatch events and
/// the store keeps the first value it sees. `duration_ms` is computed once,
/// at the transition into a terminal status, and only when a start time is
/// already on record.
pub fn reconcile(store: &StatusStore, event: &StatusEvent) -> Result<(), StorageError> {
    let Some(job_id) = event.job_id() else {
        return Ok(());
    };

    let now = event.ts.unwrap_or_else(crate::now_ms);
    let status = effective_status(event);
    let started_ts = if event.kind == KIND_DISPATCH {
        event.ts
    } else {
        None
    };

    let previous_start = store.job_started_ts(job_id)?;
    let duration_ms = match (previous_start, status) {
        (Some(started), Some(status)) if status.is_terminal() => Some(now - started),
        _ => None,
    };

    store.upsert_job(&JobRecord {
        job_id: job_id.to_string(),
        agent: event.agent.clone(),
        status,
        started_ts,
        updated_ts: now,
        duration_ms,
        prompt_text: event.prompt_text.clone(),
        prompt_hash: event.prompt_hash.clone(),
        prompt_bytes: event.prompt_bytes,
        output_path: event.output_path.clone(),
        output_bytes: event.output_bytes,
        model: event.model.clone(),
        prompt_tokens_exact: event.prompt_tokens_exact,
        completion_tokens_exact: event.completion_tokens_exact,
        total_tokens_exact: event.total_tokens_exact,
        prompt_tokens_est: event.prompt_tokens_est,
        completion_tokens_est: event.completion_tokens_est,
        total_tokens_est: event.total_tokens_est,
    })?;

    if let Some(agent) = event.agent() {
        store.upsert_agent(&AgentRecord {
            agent: agent.to_string(),
            status: Some(status.unwrap_or(JobStatus::Running)),
            last_seen: Some(now),
            pane_id: event.pane_id.clone(),
            window_name: event.window_name.clone(),
            session: event.session.clone(),
            model: event.model.clone(),
        })?;
    }

    Ok(())
}

/// Run one raw log event through the whole pipeline: normalize the prompt
/// fields, enrich, persist the immutable event row, reconcile.
pub fn ingest_log_event(store: &StatusStore, event: &mut StatusEvent) -> Result<(), StorageError> {
    normalize_event(event);
    ingest_output_event(store, event)
}

/// Pipeline tail shared with the pane watcher, whose synthesized events
/// carry no prompt and skip normalization.
pub fn ingest_output_event(
    store: &StatusStore,
    event: &mut StatusEvent,
) -> Result<(), StorageError> {
    enrich_event(event);
    store.insert_event(event)?;
    reconcile(store, event)
}
