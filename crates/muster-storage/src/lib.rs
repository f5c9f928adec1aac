use muster_core::{JobStatus, StatusEvent};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const STATUS_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// One row of the `jobs` table. Upserted with fill-missing merge semantics:
/// a stored non-null value survives an incoming null for every field except
/// `agent`, `status`, and `updated_ts`, which track the latest event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub agent: Option<String>,
    pub status: Option<JobStatus>,
    pub started_ts: Option<i64>,
    pub updated_ts: i64,
    pub duration_ms: Option<i64>,
    pub prompt_text: Option<String>,
    pub prompt_hash: Option<String>,
    pub prompt_bytes: Option<i64>,
    pub output_path: Option<String>,
    pub output_bytes: Option<i64>,
    pub model: Option<String>,
    pub prompt_tokens_exact: Option<i64>,
    pub completion_tokens_exact: Option<i64>,
    pub total_tokens_exact: Option<i64>,
    pub prompt_tokens_est: Option<i64>,
    pub completion_tokens_est: Option<i64>,
    pub total_tokens_est: Option<i64>,
}

/// One row of the `agents` table. Upserted last-write-wins: agent state
/// reflects what is true now, so every field is overwritten on each update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentRecord {
    pub agent: String,
    pub status: Option<JobStatus>,
    pub last_seen: Option<i64>,
    pub pane_id: Option<String>,
    pub window_name: Option<String>,
    pub session: Option<String>,
    pub model: Option<String>,
}

/// One row of the append-only `events` table. `payload` holds the full
/// serialized event, including fields without dedicated columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub ts: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub session: Option<String>,
    pub agent: Option<String>,
    pub pane_id: Option<String>,
    pub window_name: Option<String>,
    pub job_id: Option<String>,
    pub payload: Option<String>,
    pub prompt_hash: Option<String>,
    pub prompt_bytes: Option<i64>,
    pub output_path: Option<String>,
    pub output_bytes: Option<i64>,
    pub model: Option<String>,
    pub prompt_tokens_exact: Option<i64>,
    pub completion_tokens_exact: Option<i64>,
    pub total_tokens_exact: Option<i64>,
    pub prompt_tokens_est: Option<i64>,
    pub completion_tokens_est: Option<i64>,
    pub total_tokens_est: Option<i64>,
    pub prompt_text: Option<String>,
}

/// SQLite-backed status store. The connection is not internally synchronized;
/// concurrent writers share the store behind a mutex.
pub struct StatusStore {
    conn: Connection,
}

impl StatusStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<(), StorageError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.busy_timeout(Duration::from_millis(5000))?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STATUS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STATUS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_status_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Append one event row. The full event is serialized into `payload` so
    /// nothing is lost to the column subset.
    pub fn insert_event(&self, event: &StatusEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_string(event)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO events (
                ts, type, session, agent, pane_id, window_name, job_id, payload,
                prompt_hash, prompt_bytes, output_path, output_bytes, model,
                prompt_tokens_exact, completion_tokens_exact, total_tokens_exact,
                prompt_tokens_est, completion_tokens_est, total_tokens_est,
                prompt_text
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ",
            params![
                event.ts,
                event.kind,
                event.session,
                event.agent,
                event.pane_id,
                event.window_name,
                event.job_id,
                payload,
                event.prompt_hash,
                event.prompt_bytes,
                event.output_path,
                event.output_bytes,
                event.model,
                event.prompt_tokens_exact,
                event.completion_tokens_exact,
                event.total_tokens_exact,
                event.prompt_tokens_est,
                event.completion_tokens_est,
                event.total_tokens_est,
                event.prompt_text,
            ],
        )?;

        Ok(())
    }

    /// Fill-missing upsert: `COALESCE(jobs.x, excluded.x)` keeps the first
    /// non-null value ever stored for everything except agent, status, and
    /// updated_ts, which always track the incoming write.
    pub fn upsert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO jobs (
                job_id, agent, status, started_ts, updated_ts, duration_ms,
                prompt_text, prompt_hash, prompt_bytes, output_path, output_bytes,
                model, prompt_tokens_exact, completion_tokens_exact, total_tokens_exact,
                prompt_tokens_est, completion_tokens_est, total_tokens_est
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(job_id) DO UPDATE SET
                agent=excluded.agent,
                status=excluded.status,
                updated_ts=excluded.updated_ts,
                started_ts=COALESCE(jobs.started_ts, excluded.started_ts),
                duration_ms=COALESCE(jobs.duration_ms, excluded.duration_ms),
                prompt_text=COALESCE(jobs.prompt_text, excluded.prompt_text),
                prompt_hash=COALESCE(jobs.prompt_hash, excluded.prompt_hash),
                prompt_bytes=COALESCE(jobs.prompt_bytes, excluded.prompt_bytes),
                output_path=COALESCE(jobs.output_path, excluded.output_path),
                output_bytes=COALESCE(jobs.output_bytes, excluded.output_bytes),
                model=COALESCE(jobs.model, excluded.model),
                prompt_tokens_exact=COALESCE(jobs.prompt_tokens_exact, excluded.prompt_tokens_exact),
                completion_tokens_exact=COALESCE(jobs.completion_tokens_exact, excluded.completion_tokens_exact),
                total_tokens_exact=COALESCE(jobs.total_tokens_exact, excluded.total_tokens_exact),
                prompt_tokens_est=COALESCE(jobs.prompt_tokens_est, excluded.prompt_tokens_est),
                completion_tokens_est=COALESCE(jobs.completion_tokens_est, excluded.completion_tokens_est),
                total_tokens_est=COALESCE(jobs.total_tokens_est, excluded.total_tokens_est)
            ",
            params![
                job.job_id,
                job.agent,
                job.status.map(|status| status.as_str()),
                job.started_ts,
                job.updated_ts,
                job.duration_ms,
                job.prompt_text,
                job.prompt_hash,
                job.prompt_bytes,
                job.output_path,
                job.output_bytes,
                job.model,
                job.prompt_tokens_exact,
                job.completion_tokens_exact,
                job.total_tokens_exact,
                job.prompt_tokens_est,
                job.completion_tokens_est,
                job.total_tokens_est,
            ],
        )?;

        Ok(())
    }

    /// Last-write-wins upsert: every field mirrors the incoming record.
    pub fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO agents (agent, status, last_seen, pane_id, window_name, session, model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(agent) DO UPDATE SET
                status=excluded.status,
                last_seen=excluded.last_seen,
                pane_id=excluded.pane_id,
                window_name=excluded.window_name,
                session=excluded.session,
                model=excluded.model
            ",
            params![
                agent.agent,
                agent.status.map(|status| status.as_str()),
                agent.last_seen,
                agent.pane_id,
                agent.window_name,
                agent.session,
                agent.model,
            ],
        )?;

        Ok(())
    }

    /// The one read-before-write lookup the reconciler needs.
    pub fn job_started_ts(&self, job_id: &str) -> Result<Option<i64>, StorageError> {
        let started = self
            .conn
            .query_row(
                "SELECT started_ts FROM jobs WHERE job_id = ?1",
                [job_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(started.flatten())
    }

    pub fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StorageError> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn jobs(
        &self,
        status: Option<&str>,
        agent: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR agent = ?2)
            ORDER BY updated_ts DESC
            LIMIT ?3
            "
        ))?;

        let rows = statement.query_map(params![status, agent, limit], job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT agent, status, last_seen, pane_id, window_name, session, model
            FROM agents
            ORDER BY agent ASC
            ",
        )?;

        let rows = statement.query_map([], |row| {
            Ok(AgentRecord {
                agent: row.get(0)?,
                status: parse_status(row.get(1)?),
                last_seen: row.get(2)?,
                pane_id: row.get(3)?,
                window_name: row.get(4)?,
                session: row.get(5)?,
                model: row.get(6)?,
            })
        })?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn events_for_job(&self, job_id: &str) -> Result<Vec<EventRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE job_id = ?1
            ORDER BY ts ASC, id ASC
            "
        ))?;

        let rows = statement.query_map([job_id], event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn recent_events(
        &self,
        since_ts: Option<i64>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE (?1 IS NULL OR ts >= ?1)
            ORDER BY ts DESC, id DESC
            LIMIT ?2
            "
        ))?;

        let rows = statement.query_map(params![since_ts, limit], event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

const JOB_COLUMNS: &str = "job_id, agent, status, started_ts, updated_ts, duration_ms, \
     prompt_text, prompt_hash, prompt_bytes, output_path, output_bytes, model, \
     prompt_tokens_exact, completion_tokens_exact, total_tokens_exact, \
     prompt_tokens_est, completion_tokens_est, total_tokens_est";

const EVENT_COLUMNS: &str = "id, ts, type, session, agent, pane_id, window_name, job_id, payload, \
     prompt_hash, prompt_bytes, output_path, output_bytes, model, \
     prompt_tokens_exact, completion_tokens_exact, total_tokens_exact, \
     prompt_tokens_est, completion_tokens_est, total_tokens_est, prompt_text";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        agent: row.get(1)?,
        status: parse_status(row.get(2)?),
        started_ts: row.get(3)?,
        updated_ts: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        duration_ms: row.get(5)?,
        prompt_text: row.get(6)?,
        prompt_hash: row.get(7)?,
        prompt_bytes: row.get(8)?,
        output_path: row.get(9)?,
        output_bytes: row.get(10)?,
        model: row.get(11)?,
        prompt_tokens_exact: row.get(12)?,
        completion_tokens_exact: row.get(13)?,
        total_tokens_exact: row.get(14)?,
        prompt_tokens_est: row.get(15)?,
        completion_tokens_est: row.get(16)?,
        total_tokens_est: row.get(17)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        ts: row.get(1)?,
        kind: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        session: row.get(3)?,
        agent: row.get(4)?,
        pane_id: row.get(5)?,
        window_name: row.get(6)?,
        job_id: row.get(7)?,
        payload: row.get(8)?,
        prompt_hash: row.get(9)?,
        prompt_bytes: row.get(10)?,
        output_path: row.get(11)?,
        output_bytes: row.get(12)?,
        model: row.get(13)?,
        prompt_tokens_exact: row.get(14)?,
        completion_tokens_exact: row.get(15)?,
        total_tokens_exact: row.get(16)?,
        prompt_tokens_est: row.get(17)?,
        completion_tokens_est: row.get(18)?,
        total_tokens_est: row.get(19)?,
        prompt_text: row.get(20)?,
    })
}

fn parse_status(value: Option<String>) -> Option<JobStatus> {
    value.and_then(|value| value.parse().ok())
}
