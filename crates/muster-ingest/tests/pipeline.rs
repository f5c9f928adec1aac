use muster_core::{JobStatus, StatusEvent};
use muster_ingest::tailer::{LogTailer, TailerConfig};
use muster_ingest::watcher::{MapMode, PaneSource, PaneTarget, PaneWatcher, WatcherConfig};
use muster_ingest::{shared_store, SharedStore};
use muster_storage::StatusStore;
use std::collections::BTreeMap;
use std::io::{Seek, Write};
use tempfile::NamedTempFile;

struct ScriptedPane {
    agent: String,
    target: PaneTarget,
    capture: String,
}

impl ScriptedPane {
    fn new(agent: &str, pane_id: &str, capture: &str) -> Self {
        Self {
            agent: agent.to_string(),
            target: PaneTarget {
                pane_id: pane_id.to_string(),
                window_name: agent.to_string(),
                mode: MapMode::Windows,
            },
            capture: capture.to_string(),
        }
    }
}

impl PaneSource for ScriptedPane {
    fn map_agents(&self, _session: &str) -> BTreeMap<String, PaneTarget> {
        let mut mapping = BTreeMap::new();
        mapping.insert(self.agent.clone(), self.target.clone());
        mapping
    }

    fn capture_pane(&self, pane_id: &str, _lines: u32) -> String {
        if pane_id == self.target.pane_id {
            self.capture.clone()
        } else {
            String::new()
        }
    }
}

fn in_memory() -> SharedStore {
    shared_store(StatusStore::open_in_memory().expect("in-memory store"))
}

fn append(file: &NamedTempFile, line: &str) {
    let mut handle = file.reopen().expect("reopen");
    handle
        .seek(std::io::SeekFrom::End(0))
        .expect("seek to end");
    writeln!(handle, "{line}").expect("append");
}

#[test]
fn dispatch_then_pane_completion_finishes_the_job() {
    let file = NamedTempFile::new().expect("temp log");
    let store = in_memory();
    let mut tailer = LogTailer::new(TailerConfig::new(file.path()), store.clone());
    append(
        &file,
        r#"{"ts":1000,"type":"dispatch","job_id":"abc12345","agent":"fast","prompt_text":"summarize the logs"}"#,
    );

    let emitted = tailer.poll();
    assert_eq!(emitted.len(), 1);
    {
        let store = store.lock().unwrap();
        let job = store.job("abc12345").expect("query").expect("job row");
        assert_eq!(job.status, Some(JobStatus::Running));
        assert_eq!(job.started_ts, Some(1000));
        assert_eq!(job.prompt_bytes, Some(18));
        assert_eq!(job.prompt_tokens_est, Some(5));
        assert_eq!(job.prompt_hash.as_deref().map(str::len), Some(64));
    }

    let source = ScriptedPane::new("fast", "%3", "[JOB:abc12345] all checks done");
    let mut watcher = PaneWatcher::new(WatcherConfig::new("muster"), source, store.clone());
    let batch = watcher.poll_at(1500);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job_id.as_deref(), Some("abc12345"));
    assert_eq!(batch[0].status, Some(JobStatus::Done));

    let store = store.lock().unwrap();
    let job = store.job("abc12345").expect("query").expect("job row");
    assert_eq!(job.status, Some(JobStatus::Done));
    assert_eq!(job.started_ts, Some(1000));
    assert_eq!(job.duration_ms, Some(500));

    let agents = store.agents().expect("agents");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent, "fast");
    assert_eq!(agents[0].status, Some(JobStatus::Done));
    assert_eq!(agents[0].last_seen, Some(1500));
    assert_eq!(agents[0].pane_id.as_deref(), Some("%3"));

    let rows = store.events_for_job("abc12345").expect("events");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, "dispatch");
    assert_eq!(rows[1].kind, "pane_output");
}

#[test]
fn log_replay_keeps_immutable_job_fields() {
    let file = NamedTempFile::new().expect("temp log");
    let store = in_memory();
    append(
        &file,
        r#"{"ts":1000,"type":"dispatch","job_id":"abc12345","agent":"fast","prompt_text":"first prompt"}"#,
    );

    let mut tailer = LogTailer::new(TailerConfig::new(file.path()), store.clone());
    assert_eq!(tailer.poll().len(), 1);

    let done = ScriptedPane::new("fast", "%3", "[JOB:abc12345] finished");
    let mut watcher = PaneWatcher::new(WatcherConfig::new("muster"), done, store.clone());
    assert_eq!(watcher.poll_at(1400).len(), 1);

    let hash_before = {
        let store = store.lock().unwrap();
        let job = store.job("abc12345").expect("query").expect("job row");
        assert_eq!(job.duration_ms, Some(400));
        job.prompt_hash.clone().expect("hash")
    };

    // A fresh tailer loses its offset and replays the log from the start.
    let mut replay = LogTailer::new(TailerConfig::new(file.path()), store.clone());
    assert_eq!(replay.poll().len(), 1);

    let store = store.lock().unwrap();
    let job = store.job("abc12345").expect("query").expect("job row");
    assert_eq!(job.started_ts, Some(1000));
    assert_eq!(job.duration_ms, Some(400));
    assert_eq!(job.prompt_hash.as_deref(), Some(hash_before.as_str()));
    assert_eq!(job.status, Some(JobStatus::Running));

    // The event log itself is append-only, so the replayed row is kept.
    assert_eq!(store.events_for_job("abc12345").expect("events").len(), 3);
}

#[test]
fn pane_event_emitted_by_the_watcher_round_trips_as_json() {
    let store = in_memory();
    let source = ScriptedPane::new("deep", "%7", "model: o4-mini tokens total tokens: 91");
    let mut watcher = PaneWatcher::new(WatcherConfig::new("muster"), source, store);

    let batch = watcher.poll_at(42);
    assert_eq!(batch.len(), 1);

    let wire = serde_json::to_string(&batch[0]).expect("serialize");
    let back: StatusEvent = serde_json::from_str(&wire).expect("deserialize");
    assert_eq!(back.kind, "pane_output");
    assert_eq!(back.agent.as_deref(), Some("deep"));
    assert_eq!(back.model.as_deref(), Some("o4-mini"));
    assert_eq!(back.total_tokens_exact, Some(91));
    assert_eq!(back.ts, Some(42));
}
