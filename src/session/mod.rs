//! Short-lived session storage.
//!
//! Sessions are opaque random ids mapping to a principal id, with a fixed TTL
//! from creation. Expiry is lazy: an expired session is deleted the moment it
//! is observed, there is no background sweep. Many sessions may reference the
//! same principal; the disconnect flow deletes them all through the
//! principal-id index.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// One authenticated session.
#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: String,
    pub principal_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// SQLite-backed session store with lazy expiry.
///
/// # Schema
/// ```sql
/// CREATE TABLE sessions (
///     session_id   TEXT PRIMARY KEY,
///     principal_id TEXT NOT NULL,
///     created_at   TEXT NOT NULL,
///     expires_at   TEXT NOT NULL
/// );
/// CREATE INDEX idx_sessions_principal ON sessions(principal_id);
/// ```
pub struct SessionStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SessionStore {
    /// Opens (or creates) a session store with a fixed TTL for new sessions.
    pub fn new<P: AsRef<Path>>(db_path: P, ttl: Duration) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open sessions database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id   TEXT PRIMARY KEY,
                principal_id TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                expires_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_principal ON sessions(principal_id);
            "#,
        )
        .context("Failed to create sessions table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    /// Creates a new session for a principal and returns its opaque id.
    pub fn create(&self, principal_id: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + self.ttl;

        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO sessions (session_id, principal_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session_id,
                    principal_id,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339()
                ],
            )
            .context("Failed to create session")?;

        Ok(session_id)
    }

    /// Returns the bound principal id if the session is still valid.
    ///
    /// An expired session is deleted as a side effect and `None` is returned.
    pub fn validate(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.get(session_id)?.map(|s| s.principal_id))
    }

    /// Returns the full session record if still valid, applying lazy expiry.
    pub fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT session_id, principal_id, created_at, expires_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read session")?;

        let Some((session_id, principal_id, created_at, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = parse_timestamp(&expires_at)?;

        if Utc::now() >= expires_at {
            // Lazy expiry: delete on observation
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )
            .context("Failed to delete expired session")?;
            debug!(session = %session_id, "Deleted expired session");
            return Ok(None);
        }

        Ok(Some(Session {
            session_id,
            principal_id,
            created_at: parse_timestamp(&created_at)?,
            expires_at,
        }))
    }

    /// Deletes a session. Idempotent: deleting a missing session is not an
    /// error.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )
            .context("Failed to delete session")?;
        Ok(())
    }

    /// Deletes every session bound to a principal; returns the count removed.
    ///
    /// Fails soft: this runs inside the disconnect flow, and a session-index
    /// problem must not block credential deletion. Failures are logged and
    /// zero is returned.
    pub fn delete_all_for_principal(&self, principal_id: &str) -> usize {
        let result = self.conn.lock().unwrap().execute(
            "DELETE FROM sessions WHERE principal_id = ?1",
            params![principal_id],
        );

        match result {
            Ok(count) => {
                debug!(principal = %principal_id, count, "Deleted sessions for principal");
                count
            }
            Err(e) => {
                warn!(
                    principal = %principal_id,
                    error = %e,
                    "Failed to delete sessions for principal, continuing"
                );
                0
            }
        }
    }

    /// Replaces a valid session with a fresh one bound to the same principal.
    ///
    /// Delete-then-recreate, not in-place extension: the old id stops working
    /// immediately. Returns `None` if the old session was already invalid.
    pub fn refresh(&self, session_id: &str) -> Result<Option<String>> {
        let Some(principal_id) = self.validate(session_id)? else {
            return Ok(None);
        };

        self.delete(session_id)?;
        let new_id = self.create(&principal_id)?;
        Ok(Some(new_id))
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse stored timestamp '{}'", s))
}
