//! Append-only analytics snapshots.
//!
//! One snapshot per principal per sync run: counters summed across the posts
//! the provider returned, plus the raw payload for audit. Snapshots are never
//! mutated after insertion.

use crate::provider::AnalyticsPayload;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Aggregated engagement metrics for one principal over one reporting window.
#[derive(Clone, Debug, Serialize)]
pub struct AnalyticsSnapshot {
    pub principal_id: String,
    pub remote_subject_id: String,
    pub synced_at: DateTime<Utc>,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub impressions: i64,
    pub unique_views: i64,
    pub reactions: i64,
    pub comments: i64,
    pub shares: i64,
    pub clicks: i64,
    pub engagements: i64,
    pub post_count: i64,
    /// Raw provider payload retained for audit and debugging
    pub raw_payload: serde_json::Value,
}

impl AnalyticsSnapshot {
    /// Sums per-post counters from a fetch result into one snapshot.
    pub fn aggregate(
        principal_id: &str,
        remote_subject_id: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
        payload: &AnalyticsPayload,
    ) -> Self {
        let mut snapshot = Self {
            principal_id: principal_id.to_string(),
            remote_subject_id: remote_subject_id.to_string(),
            synced_at: Utc::now(),
            range_start,
            range_end,
            impressions: 0,
            unique_views: 0,
            reactions: 0,
            comments: 0,
            shares: 0,
            clicks: 0,
            engagements: 0,
            post_count: payload.posts.len() as i64,
            raw_payload: payload.raw.clone(),
        };

        for post in &payload.posts {
            snapshot.impressions += post.impressions;
            snapshot.unique_views += post.unique_views;
            snapshot.reactions += post.reactions;
            snapshot.comments += post.comments;
            snapshot.shares += post.shares;
            snapshot.clicks += post.clicks;
            snapshot.engagements += post.engagements;
        }

        snapshot
    }
}

/// Append-only SQLite store for analytics snapshots.
///
/// Composite primary key (principal, remote subject, synced_at); there is no
/// update path by design.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open snapshot database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS analytics_snapshots (
                principal_id      TEXT NOT NULL,
                remote_subject_id TEXT NOT NULL,
                synced_at         TEXT NOT NULL,
                range_start       TEXT NOT NULL,
                range_end         TEXT NOT NULL,
                impressions       INTEGER NOT NULL,
                unique_views      INTEGER NOT NULL,
                reactions         INTEGER NOT NULL,
                comments          INTEGER NOT NULL,
                shares            INTEGER NOT NULL,
                clicks            INTEGER NOT NULL,
                engagements       INTEGER NOT NULL,
                post_count        INTEGER NOT NULL,
                raw_payload       TEXT NOT NULL,
                PRIMARY KEY (principal_id, remote_subject_id, synced_at)
            );
            "#,
        )
        .context("Failed to create analytics_snapshots table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Appends one snapshot. Never updates an existing row.
    pub fn append(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let raw = serde_json::to_string(&snapshot.raw_payload)
            .context("Failed to serialize raw payload")?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO analytics_snapshots (
                    principal_id, remote_subject_id, synced_at,
                    range_start, range_end,
                    impressions, unique_views, reactions, comments,
                    shares, clicks, engagements, post_count, raw_payload
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    snapshot.principal_id,
                    snapshot.remote_subject_id,
                    snapshot.synced_at.to_rfc3339(),
                    snapshot.range_start.to_string(),
                    snapshot.range_end.to_string(),
                    snapshot.impressions,
                    snapshot.unique_views,
                    snapshot.reactions,
                    snapshot.comments,
                    snapshot.shares,
                    snapshot.clicks,
                    snapshot.engagements,
                    snapshot.post_count,
                    raw,
                ],
            )
            .context("Failed to append analytics snapshot")?;

        Ok(())
    }

    /// Returns the most recent snapshot for a principal, if any.
    pub fn latest_for_principal(&self, principal_id: &str) -> Result<Option<AnalyticsSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT principal_id, remote_subject_id, synced_at,
                       range_start, range_end,
                       impressions, unique_views, reactions, comments,
                       shares, clicks, engagements, post_count, raw_payload
                FROM analytics_snapshots
                WHERE principal_id = ?1
                ORDER BY synced_at DESC
                LIMIT 1
                "#,
            )
            .context("Failed to prepare snapshot query")?;

        let row = stmt
            .query_row(params![principal_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, String>(13)?,
                ))
            })
            .optional()
            .context("Failed to read snapshot row")?;

        let Some((
            principal_id,
            remote_subject_id,
            synced_at,
            range_start,
            range_end,
            impressions,
            unique_views,
            reactions,
            comments,
            shares,
            clicks,
            engagements,
            post_count,
            raw_payload,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(AnalyticsSnapshot {
            principal_id,
            remote_subject_id,
            synced_at: DateTime::parse_from_rfc3339(&synced_at)
                .map(|dt| dt.with_timezone(&Utc))
                .context("Failed to parse synced_at")?,
            range_start: range_start.parse().context("Failed to parse range_start")?,
            range_end: range_end.parse().context("Failed to parse range_end")?,
            impressions,
            unique_views,
            reactions,
            comments,
            shares,
            clicks,
            engagements,
            post_count,
            raw_payload: serde_json::from_str(&raw_payload)
                .context("Failed to parse stored raw payload")?,
        }))
    }

    /// Number of snapshots recorded for a principal.
    pub fn count_for_principal(&self, principal_id: &str) -> Result<i64> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM analytics_snapshots WHERE principal_id = ?1",
                params![principal_id],
                |row| row.get(0),
            )
            .context("Failed to count snapshots")
    }
}
