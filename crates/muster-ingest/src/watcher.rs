//! Polls agent panes and turns fresh terminal output into events.

use crate::reconcile::ingest_output_event;
use crate::SharedStore;
use muster_core::signal;
use muster_core::{JobStatus, StatusEvent, KIND_PANE_OUTPUT};
use muster_storage::AgentRecord;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// How an agent's pane was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// One window per agent, named after it.
    Windows,
    /// Panes tagged via a session option or matched by title/command.
    Panes,
}

impl MapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapMode::Windows => "windows",
            MapMode::Panes => "panes",
        }
    }
}

/// A resolved agent pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneTarget {
    pub pane_id: String,
    pub window_name: String,
    pub mode: MapMode,
}

/// The terminal-multiplexer surface the watcher polls. The real
/// implementation shells out to tmux; tests script a fake.
pub trait PaneSource {
    /// Current agent-to-pane mapping for the session.
    fn map_agents(&self, session: &str) -> BTreeMap<String, PaneTarget>;

    /// Rendered text of the last `lines` lines of a pane, surrounding
    /// whitespace stripped. Empty on any failure.
    fn capture_pane(&self, pane_id: &str, lines: u32) -> String;

    /// A pane with nothing renderable in its recent tail is considered dead.
    fn pane_is_responsive(&self, pane_id: &str) -> bool {
        !self.capture_pane(pane_id, 10).is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub session: String,
    pub poll_interval: Duration,
    pub capture_lines: u32,
}

impl WatcherConfig {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            poll_interval: Duration::from_millis(200),
            capture_lines: 2000,
        }
    }
}

/// New output since the previous capture. A capture extending the previous
/// one contributes only its suffix; anything else is a redraw and counts
/// whole. Surrounding blank lines are noise from the terminal and dropped.
fn pane_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    let delta = current.strip_prefix(previous).unwrap_or(current);
    delta.trim_matches('\n')
}

/// Diffs each mapped agent's pane against the last-seen capture and runs
/// every non-empty delta through the ingest pipeline as a `pane_output`
/// event.
pub struct PaneWatcher<P: PaneSource> {
    config: WatcherConfig,
    source: P,
    store: SharedStore,
    last_text: HashMap<String, String>,
}

impl<P: PaneSource> PaneWatcher<P> {
    pub fn new(config: WatcherConfig, source: P, store: SharedStore) -> Self {
        Self {
            config,
            source,
            store,
            last_text: HashMap::new(),
        }
    }

    pub fn poll(&mut self) -> Vec<StatusEvent> {
        self.poll_at(crate::now_ms())
    }

    /// One poll tick against an explicit clock. Events come back in agent
    /// order within the tick.
    pub fn poll_at(&mut self, now: i64) -> Vec<StatusEvent> {
        let mapping = self.source.map_agents(&self.config.session);
        let mut batch = Vec::new();
        for (agent, target) in mapping {
            let capture = self
                .source
                .capture_pane(&target.pane_id, self.config.capture_lines);
            if capture.is_empty() {
                continue;
            }
            let previous = self
                .last_text
                .get(&target.pane_id)
                .cloned()
                .unwrap_or_default();
            if capture == previous {
                continue;
            }
            self.last_text.insert(target.pane_id.clone(), capture.clone());

            let delta = pane_delta(&previous, &capture);
            if delta.is_empty() {
                continue;
            }
            let auth_blocked = signal::auth_needed(delta);

            let mut event = StatusEvent {
                ts: Some(now),
                kind: KIND_PANE_OUTPUT.to_string(),
                agent: Some(agent.clone()),
                pane_id: Some(target.pane_id.clone()),
                window_name: Some(target.window_name.clone()),
                text: Some(delta.to_string()),
                ..Default::default()
            };

            let result = {
                let store = self.store.lock().unwrap();
                ingest_output_event(&store, &mut event)
            };
            match result {
                Ok(()) => {
                    if auth_blocked {
                        self.mark_agent_blocked(&agent, &target, event.model.clone(), now);
                    }
                    batch.push(event);
                }
                Err(err) => warn!("failed to persist pane event for {agent}: {err}"),
            }
        }
        batch
    }

    /// An authentication prompt in the delta overrides whatever status the
    /// reconciler derived for this agent.
    fn mark_agent_blocked(&self, agent: &str, target: &PaneTarget, model: Option<String>, now: i64) {
        let store = self.store.lock().unwrap();
        let result = store.upsert_agent(&AgentRecord {
            agent: agent.to_string(),
            status: Some(JobStatus::Blocked),
            last_seen: Some(now),
            pane_id: Some(target.pane_id.clone()),
            window_name: Some(target.window_name.clone()),
            session: None,
            model,
        });
        if let Err(err) = result {
            warn!("failed to mark agent {agent} blocked: {err}");
        }
    }

    /// Drive the watcher on its poll interval, fanning each recorded event
    /// out to the sink. Capture and store work runs off the async scheduler.
    pub async fn run(self, sink: broadcast::Sender<StatusEvent>)
    where
        P: Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut watcher = self;
        loop {
            ticker.tick().await;
            let (returned, batch) = match tokio::task::spawn_blocking(move || {
                let batch = watcher.poll();
                (watcher, batch)
            })
            .await
            {
                Ok(output) => output,
                Err(err) => {
                    error!("watcher tick aborted: {err}");
                    return;
                }
            };
            watcher = returned;
            for event in batch {
                let _ = sink.send(event);
            }
        }
    }
}
