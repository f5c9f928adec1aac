//! Incremental tailer over the append-only dispatch event log.

use crate::reconcile::ingest_log_event;
use crate::SharedStore;
use muster_core::StatusEvent;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub events_path: PathBuf,
    pub poll_interval: Duration,
    pub max_line_bytes: usize,
}

impl TailerConfig {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
            poll_interval: Duration::from_millis(200),
            max_line_bytes: 200_000,
        }
    }
}

/// Reads newly appended NDJSON lines from the event log, runs each through
/// the ingest pipeline, and emits the enriched events in file order.
///
/// The byte offset only ever advances past complete lines, so a partially
/// written tail is left for the next tick. A log that shrinks below the
/// offset is treated as truncated and re-read from the start.
pub struct LogTailer {
    config: TailerConfig,
    store: SharedStore,
    offset: u64,
}

impl LogTailer {
    pub fn new(config: TailerConfig, store: SharedStore) -> Self {
        Self {
            config,
            store,
            offset: 0,
        }
    }

    /// Create the log file (and its parent directory) if missing so other
    /// processes can append to it immediately.
    pub fn ensure_log_file(&self) -> std::io::Result<()> {
        if let Some(parent) = self.config.events_path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.events_path)?;
        Ok(())
    }

    /// One poll tick. Returns the events that were durably recorded this
    /// tick, in the order they appear in the log.
    pub fn poll(&mut self) -> Vec<StatusEvent> {
        let chunk = match self.read_new_lines() {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("event log read failed: {err}");
                return Vec::new();
            }
        };

        let mut batch = Vec::new();
        for line in chunk.split(|byte| *byte == b'\n') {
            if line.len() > self.config.max_line_bytes {
                warn!("skipping oversized event line ({} bytes)", line.len());
                continue;
            }
            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut event: StatusEvent = match serde_json::from_str(trimmed) {
                Ok(event) => event,
                Err(err) => {
                    debug!("skipping malformed event line: {err}");
                    continue;
                }
            };
            let result = {
                let store = self.store.lock().unwrap();
                ingest_log_event(&store, &mut event)
            };
            match result {
                Ok(()) => batch.push(event),
                Err(err) => warn!("failed to persist event: {err}"),
            }
        }
        batch
    }

    /// Read everything appended since the last tick, up to and including the
    /// last complete line. Advances the offset only over what is returned.
    fn read_new_lines(&mut self) -> std::io::Result<Vec<u8>> {
        let metadata = match fs::metadata(&self.config.events_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        if metadata.len() < self.offset {
            debug!("event log shrank below the read offset, starting over");
            self.offset = 0;
        }
        if metadata.len() == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.config.events_path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        match buffer.iter().rposition(|byte| *byte == b'\n') {
            Some(last_newline) => {
                buffer.truncate(last_newline + 1);
                self.offset += buffer.len() as u64;
                Ok(buffer)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Drive the tailer on its poll interval, fanning each recorded event
    /// out to the sink. File and store work runs off the async scheduler.
    pub async fn run(self, sink: broadcast::Sender<StatusEvent>) {
        if let Err(err) = self.ensure_log_file() {
            error!(
                "cannot create event log {}: {err}",
                self.config.events_path.display()
            );
        }
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut tailer = self;
        loop {
            ticker.tick().await;
            let (returned, batch) = match tokio::task::spawn_blocking(move || {
                let batch = tailer.poll();
                (tailer, batch)
            })
            .await
            {
                Ok(output) => output,
                Err(err) => {
                    error!("tailer tick aborted: {err}");
                    return;
                }
            };
            tailer = returned;
            for event in batch {
                let _ = sink.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_store;
    use muster_core::JobStatus;
    use muster_storage::StatusStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tailer_for(file: &NamedTempFile) -> LogTailer {
        let store = shared_store(StatusStore::open_in_memory().expect("in-memory store"));
        let mut config = TailerConfig::new(file.path());
        config.max_line_bytes = 500;
        LogTailer::new(config, store)
    }

    fn append(file: &NamedTempFile, line: &str) {
        let mut handle = file.reopen().expect("reopen");
        handle.seek(SeekFrom::End(0)).expect("seek");
        writeln!(handle, "{line}").expect("append");
    }

    #[test]
    fn dispatch_line_produces_job_and_agent_rows() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        append(
            &file,
            r#"{"ts":1,"type":"dispatch","job_id":"abc123","agent":"fast"}"#,
        );

        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);

        let store = tailer.store.lock().unwrap();
        let job = store.job("abc123").expect("query").expect("job row");
        assert_eq!(job.status, Some(JobStatus::Running));
        assert_eq!(job.started_ts, Some(1));
        let agents = store.agents().expect("agents");
        assert_eq!(agents[0].agent, "fast");
        assert_eq!(agents[0].status, Some(JobStatus::Running));
    }

    #[test]
    fn malformed_and_oversized_lines_are_skipped() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        append(&file, "not json at all");
        append(&file, &format!(r#"{{"ts":1,"text":"{}"}}"#, "x".repeat(600)));
        append(&file, r#"{"ts":2,"type":"dispatch","job_id":"abc123"}"#);

        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].ts, Some(2));
    }

    #[test]
    fn line_that_fails_to_persist_is_dropped_and_not_retried() {
        let file = NamedTempFile::new().expect("temp file");
        let db = NamedTempFile::new().expect("temp db");
        let store = shared_store(StatusStore::open(db.path()).expect("file store"));
        let mut tailer = LogTailer::new(TailerConfig::new(file.path()), store.clone());

        let admin = rusqlite::Connection::open(db.path()).expect("second connection");
        admin
            .execute("ALTER TABLE events RENAME TO events_hidden", [])
            .expect("hide events table");

        append(&file, r#"{"ts":1,"type":"dispatch","job_id":"aaa111","agent":"fast"}"#);
        assert!(tailer.poll().is_empty());

        admin
            .execute("ALTER TABLE events_hidden RENAME TO events", [])
            .expect("restore events table");

        append(&file, r#"{"ts":2,"type":"dispatch","job_id":"bbb222","agent":"fast"}"#);
        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id.as_deref(), Some("bbb222"));

        let store = store.lock().unwrap();
        assert!(store.job("aaa111").expect("query").is_none());
        let job = store.job("bbb222").expect("query").expect("job row");
        assert_eq!(job.status, Some(JobStatus::Running));
    }

    #[test]
    fn partial_final_line_waits_for_its_newline() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        let mut handle = file.reopen().expect("reopen");
        write!(handle, r#"{{"ts":1,"type":"dispatch","#).expect("write");

        assert!(tailer.poll().is_empty());

        writeln!(handle, r#""job_id":"abc123"}}"#).expect("finish line");
        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn offset_resumes_where_the_last_tick_stopped() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        append(&file, r#"{"ts":1,"type":"dispatch","job_id":"aaa111"}"#);
        assert_eq!(tailer.poll().len(), 1);

        assert!(tailer.poll().is_empty());

        append(&file, r#"{"ts":2,"type":"dispatch","job_id":"bbb222"}"#);
        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id.as_deref(), Some("bbb222"));
    }

    #[test]
    fn truncated_log_is_read_from_the_start() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        append(&file, r#"{"ts":1,"type":"dispatch","job_id":"aaa111"}"#);
        append(&file, r#"{"ts":2,"type":"dispatch","job_id":"bbb222"}"#);
        assert_eq!(tailer.poll().len(), 2);

        let handle = file.reopen().expect("reopen");
        handle.set_len(0).expect("truncate");
        append(&file, r#"{"ts":3,"type":"dispatch","job_id":"ccc333"}"#);

        let batch = tailer.poll();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id.as_deref(), Some("ccc333"));
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = shared_store(StatusStore::open_in_memory().expect("in-memory store"));
        let config = TailerConfig::new(dir.path().join("nested/events.ndjson"));
        let mut tailer = LogTailer::new(config, store);

        assert!(tailer.poll().is_empty());

        tailer.ensure_log_file().expect("create log");
        assert!(tailer.config.events_path.is_file());
        assert!(tailer.poll().is_empty());
    }

    #[test]
    fn events_come_back_in_file_order() {
        let file = NamedTempFile::new().expect("temp file");
        let mut tailer = tailer_for(&file);
        append(&file, r#"{"ts":1,"type":"dispatch","job_id":"aaa111"}"#);
        append(&file, r#"{"ts":2,"type":"dispatch","job_id":"bbb222"}"#);

        let batch = tailer.poll();
        let ids: Vec<_> = batch.iter().filter_map(|event| event.job_id()).collect();
        assert_eq!(ids, ["aaa111", "bbb222"]);
    }
}
