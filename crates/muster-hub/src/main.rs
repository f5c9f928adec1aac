use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use muster_core::{signal, StatusEvent};
use muster_ingest::tailer::{LogTailer, TailerConfig};
use muster_ingest::tmux::TmuxProbe;
use muster_ingest::watcher::{PaneSource, PaneWatcher, WatcherConfig};
use muster_ingest::{now_ms, shared_store, SharedStore};
use muster_storage::{AgentRecord, EventRecord, JobRecord, StatusStore, StorageError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    data_dir: PathBuf,
    events_path: PathBuf,
    db_path: PathBuf,
    session: String,
    tail_interval: Duration,
    max_line_bytes: usize,
    dispatch_bin: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "muster-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    data_dir: String,
    #[arg(long, default_value = "")]
    events_path: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long)]
    tail_ms: Option<u64>,
    #[arg(long)]
    max_line_bytes: Option<usize>,
    #[arg(long, default_value = "")]
    dispatch_bin: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone)]
struct AppState {
    store: SharedStore,
    events: broadcast::Sender<StatusEvent>,
    config: Config,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    #[serde(default = "default_jobs_limit")]
    limit: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

fn default_jobs_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: Option<i64>,
    #[serde(default = "default_events_limit")]
    limit: i64,
}

fn default_events_limit() -> i64 {
    200
}

#[derive(Debug, Default, Deserialize)]
struct DispatchRequest {
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    parallel: Option<bool>,
    #[serde(default)]
    wait: Option<bool>,
    #[serde(default)]
    outdir: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    if let Err(err) = fs::create_dir_all(&config.data_dir) {
        error!(event = "data_dir_error", error = %err, path = %config.data_dir.display());
        return;
    }
    let store = match StatusStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_error", error = %err, path = %config.db_path.display());
            return;
        }
    };
    let store = shared_store(store);

    let (events, _) = broadcast::channel::<StatusEvent>(EVENT_CHANNEL_CAPACITY);

    let mut tailer_config = TailerConfig::new(config.events_path.clone());
    tailer_config.poll_interval = config.tail_interval;
    tailer_config.max_line_bytes = config.max_line_bytes;
    let tailer = LogTailer::new(tailer_config, store.clone());
    tokio::spawn(tailer.run(events.clone()));

    let mut watcher_config = WatcherConfig::new(config.session.clone());
    watcher_config.poll_interval = config.tail_interval;
    let watcher = PaneWatcher::new(watcher_config, TmuxProbe, store.clone());
    tokio::spawn(watcher.run(events.clone()));

    let state = AppState {
        store,
        events,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:job_id", get(job_detail))
        .route("/api/events", get(list_events))
        .route("/api/doctor", get(doctor))
        .route("/api/dispatch", post(dispatch))
        .route("/ws/events", get(ws_events))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %addr);
            return;
        }
    };

    info!(event = "hub_start", addr = %addr, session = %config.session);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "ts": now_ms() }))
}

async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentRecord>>, (StatusCode, String)> {
    let agents = with_store(state.store.clone(), |store| store.agents()).await?;
    Ok(Json(agents))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<JobRecord>>, (StatusCode, String)> {
    let jobs = with_store(state.store.clone(), move |store| {
        let status = query.status.as_deref().filter(|value| !value.is_empty());
        let agent = query.agent.as_deref().filter(|value| !value.is_empty());
        store.jobs(status, agent, query.limit)
    })
    .await?;
    Ok(Json(jobs))
}

async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (job, events) = with_store(state.store.clone(), move |store| {
        let job = store.job(&job_id)?;
        let events = store.events_for_job(&job_id)?;
        Ok((job, events))
    })
    .await?;
    match job {
        Some(job) => Ok(Json(json!({ "job": job, "events": events }))),
        None => Err((StatusCode::NOT_FOUND, "unknown job id".to_string())),
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, (StatusCode, String)> {
    let events = with_store(state.store.clone(), move |store| {
        store.recent_events(query.since, query.limit)
    })
    .await?;
    Ok(Json(events))
}

async fn doctor(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    let session = state.config.session.clone();
    let report = tokio::task::spawn_blocking(move || build_doctor_report(&TmuxProbe, &session))
        .await
        .map_err(internal_error)?;
    Ok(Json(report))
}

/// Per-agent pane health: whether the pane renders anything at all, and
/// whether its recent tail shows an authentication prompt.
fn build_doctor_report(source: &impl PaneSource, session: &str) -> Value {
    let mut agents = serde_json::Map::new();
    for (agent, target) in source.map_agents(session) {
        let responsive = source.pane_is_responsive(&target.pane_id);
        let tail = source.capture_pane(&target.pane_id, 30);
        agents.insert(
            agent,
            json!({
                "pane_id": target.pane_id,
                "window_name": target.window_name,
                "mode": target.mode.as_str(),
                "responsive": responsive,
                "auth_needed": signal::auth_needed(&tail),
            }),
        );
    }
    json!({ "agents": agents })
}

async fn dispatch(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let args = dispatch_args(&request);
    let mut command = tokio::process::Command::new(&state.config.dispatch_bin);
    command.args(&args);
    if let Some(job_id) = request.job_id.as_deref().filter(|id| !id.is_empty()) {
        command.env("MUSTER_JOB_ID", job_id);
    }
    let child = command.spawn().map_err(internal_error)?;
    let pid = child.id();
    info!(
        event = "dispatch",
        pid = ?pid,
        targets = ?request.targets,
        job_id = ?request.job_id
    );
    Ok(Json(json!({
        "ok": true,
        "pid": pid,
        "job_id": request.job_id,
    })))
}

/// Argument vector for the dispatch CLI. Boolean options are passed as 0/1
/// whenever the request mentions them; everything else is included only when
/// non-empty.
fn dispatch_args(request: &DispatchRequest) -> Vec<String> {
    let mut args = vec!["send".to_string()];
    for target in &request.targets {
        args.push(format!("@{target}"));
    }
    if let Some(parallel) = request.parallel {
        args.push("--parallel".to_string());
        args.push(if parallel { "1" } else { "0" }.to_string());
    }
    if let Some(wait) = request.wait {
        args.push("--wait".to_string());
        args.push(if wait { "1" } else { "0" }.to_string());
    }
    if let Some(outdir) = request.outdir.as_deref().filter(|dir| !dir.is_empty()) {
        args.push("--outdir".to_string());
        args.push(outdir.to_string());
    }
    if !request.prompt.is_empty() {
        args.push("--prompt".to_string());
        args.push(request.prompt.clone());
    }
    args
}

async fn ws_events(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

/// Forward every broadcast event to this socket as a JSON text frame.
/// Receivers that fall behind the channel skip the missed events; inbound
/// frames are ignored except to notice the peer going away.
async fn stream_events(socket: WebSocket, mut events: broadcast::Receiver<StatusEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let text = match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "serialize_error", error = %err);
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "subscriber_lagged", skipped = skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn with_store<T, F>(store: SharedStore, work: F) -> Result<T, (StatusCode, String)>
where
    T: Send + 'static,
    F: FnOnce(&StatusStore) -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap();
        work(&store)
    })
    .await
    .map_err(internal_error)?
    .map_err(internal_error)
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_string(&args.addr, "MUSTER_ADDR", "127.0.0.1:7700");
    let data_dir = resolve_path(&args.data_dir, "MUSTER_DIR").unwrap_or_else(default_data_dir);
    let events_path = resolve_path(&args.events_path, "MUSTER_EVENTS")
        .unwrap_or_else(|| data_dir.join("events.ndjson"));
    let db_path =
        resolve_path(&args.db_path, "MUSTER_DB").unwrap_or_else(|| data_dir.join("muster.db"));
    let session = resolve_string(&args.session, "MUSTER_SESSION", "muster");
    let tail_ms = args
        .tail_ms
        .or_else(|| env_number("MUSTER_TAIL_MS"))
        .unwrap_or(200);
    let max_line_bytes = args
        .max_line_bytes
        .or_else(|| env_number("MUSTER_MAX_EVENT_LINE"))
        .unwrap_or(200_000);
    let dispatch_bin = resolve_string(&args.dispatch_bin, "MUSTER_DISPATCH_BIN", "muster");
    let debug = args.debug || env_true("MUSTER_DEBUG");

    Config {
        addr,
        data_dir,
        events_path,
        db_path,
        session,
        tail_interval: Duration::from_millis(tail_ms),
        max_line_bytes,
        dispatch_bin,
        debug,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("MUSTER_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_string(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

fn resolve_path(flag: &str, env_key: &str) -> Option<PathBuf> {
    if !flag.trim().is_empty() {
        return Some(PathBuf::from(flag));
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".muster"))
        .unwrap_or_else(|| PathBuf::from(".muster"))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_ingest::watcher::{MapMode, PaneTarget};
    use std::collections::{BTreeMap, HashMap};

    struct FakeProbe {
        mapping: BTreeMap<String, PaneTarget>,
        captures: HashMap<String, String>,
    }

    impl PaneSource for FakeProbe {
        fn map_agents(&self, _session: &str) -> BTreeMap<String, PaneTarget> {
            self.mapping.clone()
        }

        fn capture_pane(&self, pane_id: &str, _lines: u32) -> String {
            self.captures.get(pane_id).cloned().unwrap_or_default()
        }
    }

    fn target(pane_id: &str, window_name: &str) -> PaneTarget {
        PaneTarget {
            pane_id: pane_id.to_string(),
            window_name: window_name.to_string(),
            mode: MapMode::Windows,
        }
    }

    #[test]
    fn dispatch_args_cover_every_supplied_field() {
        let request = DispatchRequest {
            targets: vec!["fast".to_string(), "deep".to_string()],
            prompt: "run the suite".to_string(),
            parallel: Some(true),
            wait: Some(false),
            outdir: Some("/tmp/out".to_string()),
            job_id: Some("abc12345".to_string()),
        };
        assert_eq!(
            dispatch_args(&request),
            [
                "send",
                "@fast",
                "@deep",
                "--parallel",
                "1",
                "--wait",
                "0",
                "--outdir",
                "/tmp/out",
                "--prompt",
                "run the suite"
            ]
        );
    }

    #[test]
    fn dispatch_args_omit_absent_fields() {
        assert_eq!(dispatch_args(&DispatchRequest::default()), ["send"]);
    }

    #[test]
    fn doctor_report_flags_dead_and_auth_blocked_panes() {
        let mut mapping = BTreeMap::new();
        mapping.insert("fast".to_string(), target("%1", "fast"));
        mapping.insert("deep".to_string(), target("%2", "deep"));
        let mut captures = HashMap::new();
        captures.insert("%1".to_string(), "please sign in via browser".to_string());
        let probe = FakeProbe { mapping, captures };

        let report = build_doctor_report(&probe, "muster");
        assert_eq!(report["agents"]["fast"]["responsive"], json!(true));
        assert_eq!(report["agents"]["fast"]["auth_needed"], json!(true));
        assert_eq!(report["agents"]["fast"]["mode"], json!("windows"));
        assert_eq!(report["agents"]["deep"]["responsive"], json!(false));
        assert_eq!(report["agents"]["deep"]["auth_needed"], json!(false));
    }

    #[test]
    fn query_limits_default_like_the_api_documents() {
        let jobs: JobsQuery = serde_json::from_str("{}").expect("jobs defaults");
        assert_eq!(jobs.limit, 50);
        assert!(jobs.status.is_none());
        assert!(jobs.agent.is_none());

        let events: EventsQuery = serde_json::from_str("{}").expect("events defaults");
        assert_eq!(events.limit, 200);
        assert!(events.since.is_none());
    }
}
