//! Sync job bookkeeping.
//!
//! One row per orchestration run. A row is created in `running` state when
//! the run starts and finalized exactly once when it ends; the terminal
//! status is a pure function of the counters. Error and success lists are
//! typed in memory and serialized to JSON only at the storage boundary.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Sync job state machine: running → completed | partial | failed (terminal).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "partial" => Ok(SyncStatus::Partial),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(anyhow!("Unknown sync status '{}'", other)),
        }
    }

    /// Terminal status from the final counters, evaluated once after every
    /// principal has been processed.
    pub fn from_counts(total_users: usize, success_count: usize, error_count: usize) -> Self {
        if error_count == 0 {
            SyncStatus::Completed
        } else if success_count == 0 && total_users > 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        }
    }
}

/// What started the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            other => Err(anyhow!("Unknown trigger type '{}'", other)),
        }
    }
}

/// One sync run's outcome record.
#[derive(Clone, Debug, Serialize)]
pub struct SyncLog {
    pub job_id: String,
    pub trigger: TriggerType,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_users: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub success_details: Vec<String>,
}

/// Terminal fields written at finalization.
#[derive(Clone, Debug, Default)]
pub struct SyncOutcome {
    pub total_users: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub success_details: Vec<String>,
}

/// SQLite-backed sync log store.
///
/// # Schema
/// ```sql
/// CREATE TABLE sync_logs (
///     job_id          TEXT PRIMARY KEY,
///     trigger_type    TEXT NOT NULL,
///     status          TEXT NOT NULL,
///     started_at      TEXT NOT NULL,
///     completed_at    TEXT,
///     total_users     INTEGER NOT NULL,
///     success_count   INTEGER NOT NULL,
///     error_count     INTEGER NOT NULL,
///     errors          TEXT NOT NULL,  -- JSON array of strings
///     success_details TEXT NOT NULL   -- JSON array of strings
/// );
/// CREATE INDEX idx_sync_logs_started ON sync_logs(started_at);
/// ```
pub struct SyncLogStore {
    conn: Mutex<Connection>,
}

impl SyncLogStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open sync log database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_logs (
                job_id          TEXT PRIMARY KEY,
                trigger_type    TEXT NOT NULL,
                status          TEXT NOT NULL,
                started_at      TEXT NOT NULL,
                completed_at    TEXT,
                total_users     INTEGER NOT NULL,
                success_count   INTEGER NOT NULL,
                error_count     INTEGER NOT NULL,
                errors          TEXT NOT NULL,
                success_details TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_started ON sync_logs(started_at);
            "#,
        )
        .context("Failed to create sync_logs table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a new sync job in `running` state and returns its id.
    pub fn start(&self, trigger: TriggerType) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO sync_logs (
                    job_id, trigger_type, status, started_at, completed_at,
                    total_users, success_count, error_count, errors, success_details
                )
                VALUES (?1, ?2, 'running', ?3, NULL, 0, 0, 0, '[]', '[]')
                "#,
                params![job_id, trigger.as_str(), now.to_rfc3339()],
            )
            .context("Failed to insert sync log")?;

        Ok(job_id)
    }

    /// Writes the terminal fields for a running job.
    ///
    /// Guarded on `status = 'running'` so finalization happens exactly once;
    /// returns `false` if the job was already terminal (or unknown).
    pub fn finalize(&self, job_id: &str, outcome: &SyncOutcome) -> Result<bool> {
        let status = SyncStatus::from_counts(
            outcome.total_users,
            outcome.success_count,
            outcome.error_count,
        );

        let errors_json =
            serde_json::to_string(&outcome.errors).context("Failed to serialize error list")?;
        let details_json = serde_json::to_string(&outcome.success_details)
            .context("Failed to serialize success list")?;

        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE sync_logs SET
                    status = ?2,
                    completed_at = ?3,
                    total_users = ?4,
                    success_count = ?5,
                    error_count = ?6,
                    errors = ?7,
                    success_details = ?8
                WHERE job_id = ?1 AND status = 'running'
                "#,
                params![
                    job_id,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    outcome.total_users as i64,
                    outcome.success_count as i64,
                    outcome.error_count as i64,
                    errors_json,
                    details_json,
                ],
            )
            .context("Failed to finalize sync log")?;

        Ok(rows == 1)
    }

    /// Returns one sync log by job id.
    pub fn get(&self, job_id: &str) -> Result<Option<SyncLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("{} WHERE job_id = ?1", SELECT_BASE))
            .context("Failed to prepare sync log query")?;

        let log = stmt
            .query_row(params![job_id], row_to_log)
            .optional()
            .context("Failed to read sync log")?;

        log.map(finish_row).transpose()
    }

    /// Returns the most recent sync logs, newest first.
    pub fn latest(&self, limit: usize) -> Result<Vec<SyncLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "{} ORDER BY started_at DESC LIMIT ?1",
                SELECT_BASE
            ))
            .context("Failed to prepare sync log listing")?;

        let rows = stmt
            .query_map(params![limit as i64], row_to_log)
            .context("Failed to list sync logs")?
            .collect::<Result<Vec<RawLogRow>, _>>()
            .context("Failed to read sync log rows")?;

        rows.into_iter().map(finish_row).collect()
    }
}

const SELECT_BASE: &str = "SELECT job_id, trigger_type, status, started_at, completed_at, \
     total_users, success_count, error_count, errors, success_details FROM sync_logs";

type RawLogRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
    String,
    String,
);

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLogRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn finish_row(raw: RawLogRow) -> Result<SyncLog> {
    let (
        job_id,
        trigger,
        status,
        started_at,
        completed_at,
        total_users,
        success_count,
        error_count,
        errors,
        success_details,
    ) = raw;

    Ok(SyncLog {
        job_id,
        trigger: TriggerType::parse(&trigger)?,
        status: SyncStatus::parse(&status)?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        total_users: total_users as usize,
        success_count: success_count as usize,
        error_count: error_count as usize,
        errors: serde_json::from_str(&errors).context("Failed to parse stored error list")?,
        success_details: serde_json::from_str(&success_details)
            .context("Failed to parse stored success list")?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse stored timestamp '{}'", s))
}
