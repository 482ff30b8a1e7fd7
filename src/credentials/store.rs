//! Encrypted credential storage using SQLite.
//!
//! One row per principal, tokens encrypted at rest with AES-256-GCM. The
//! store also owns the refresh-ahead read path: `get_valid_access_token`
//! transparently refreshes a token that is inside the skew window, so callers
//! never see a stale token and never orchestrate a refresh themselves.

use super::{Cipher, CredentialRecord, ProfileSummary, TokenSet};
use crate::provider::OauthClient;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Failure modes of the refresh-ahead token read.
///
/// `ReauthorizationRequired` is the one callers act on: the stored record
/// cannot be refreshed and the principal has to go through the OAuth flow
/// again. The rest are surfaced as-is.
#[derive(Debug)]
pub enum TokenAccessError {
    /// No credential record exists for the principal
    NotConnected,
    /// Token is expiring or expired and no refresh token is stored
    ReauthorizationRequired,
    /// The provider rejected the refresh attempt
    RefreshFailed(anyhow::Error),
    /// Storage or decryption failure
    Store(anyhow::Error),
}

impl std::fmt::Display for TokenAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenAccessError::NotConnected => write!(f, "No connected account"),
            TokenAccessError::ReauthorizationRequired => {
                write!(f, "Access token expired and no refresh token is available; re-authorization required")
            }
            TokenAccessError::RefreshFailed(e) => write!(f, "Token refresh failed: {}", e),
            TokenAccessError::Store(e) => write!(f, "Credential store error: {}", e),
        }
    }
}

impl std::error::Error for TokenAccessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenAccessError::RefreshFailed(e) | TokenAccessError::Store(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     principal_id      TEXT PRIMARY KEY,
///     remote_subject_id TEXT,
///     access_token      TEXT NOT NULL,  -- Encrypted blob (nonce:ciphertext)
///     refresh_token     TEXT,           -- Encrypted blob (optional)
///     expires_at        TEXT NOT NULL,  -- ISO 8601 timestamp
///     last_refreshed_at TEXT,           -- ISO 8601 timestamp (optional)
///     profile           TEXT,           -- Cached profile as JSON (optional)
///     created_at        TEXT NOT NULL,
///     updated_at        TEXT NOT NULL
/// );
/// ```
///
/// # Thread safety
/// Connection is wrapped in a Mutex; SQLite's per-row atomicity is all the
/// refresh path needs, no multi-record transactions exist here.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Cipher,
    refresh_skew: Duration,
}

impl CredentialStore {
    /// Opens (or creates) a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `cipher` - Validated token cipher (see [`Cipher::new`])
    /// * `refresh_skew` - Lead time before expiry at which tokens are
    ///   proactively refreshed
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Cipher, refresh_skew: Duration) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credentials database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                principal_id      TEXT PRIMARY KEY,
                remote_subject_id TEXT,
                access_token      TEXT NOT NULL,
                refresh_token     TEXT,
                expires_at        TEXT NOT NULL,
                last_refreshed_at TEXT,
                profile           TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
            refresh_skew,
        })
    }

    /// Stores a full credential record for a principal (creates or overwrites).
    ///
    /// `created_at` is preserved when the principal reconnects; everything
    /// else is replaced.
    pub fn put(
        &self,
        principal_id: &str,
        remote_subject_id: Option<&str>,
        tokens: &TokenSet,
        profile: Option<&ProfileSummary>,
    ) -> Result<()> {
        let access_blob = self
            .cipher
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt access token")?;

        let refresh_blob = match &tokens.refresh_token {
            Some(token) => Some(
                self.cipher
                    .encrypt(token)
                    .context("Failed to encrypt refresh token")?,
            ),
            None => None,
        };

        let profile_json = profile
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize profile cache")?;

        let now = Utc::now();
        let expires_at = expiry_from(now, tokens.expires_in_secs)?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    principal_id, remote_subject_id,
                    access_token, refresh_token,
                    expires_at, last_refreshed_at, profile,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?7)
                ON CONFLICT(principal_id) DO UPDATE SET
                    remote_subject_id = excluded.remote_subject_id,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    last_refreshed_at = NULL,
                    profile = excluded.profile,
                    updated_at = excluded.updated_at
                "#,
                params![
                    principal_id,
                    remote_subject_id,
                    access_blob,
                    refresh_blob,
                    expires_at.to_rfc3339(),
                    profile_json,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    /// Retrieves and decrypts the credential record for a principal.
    pub fn get(&self, principal_id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT principal_id, remote_subject_id,
                       access_token, refresh_token,
                       expires_at, last_refreshed_at, profile,
                       created_at, updated_at
                FROM credentials
                WHERE principal_id = ?1
                "#,
            )
            .context("Failed to prepare credential query")?;

        let row = stmt
            .query_row(params![principal_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .optional()
            .context("Failed to read credential row")?;

        let Some((
            principal_id,
            remote_subject_id,
            access_blob,
            refresh_blob,
            expires_at,
            last_refreshed_at,
            profile_json,
            created_at,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let access_token = self
            .cipher
            .decrypt(&access_blob)
            .context("Failed to decrypt access token")?;

        let refresh_token = refresh_blob
            .map(|blob| self.cipher.decrypt(&blob))
            .transpose()
            .context("Failed to decrypt refresh token")?;

        let profile = profile_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("Failed to parse cached profile")?;

        Ok(Some(CredentialRecord {
            principal_id,
            remote_subject_id,
            access_token,
            refresh_token,
            expires_at: parse_timestamp(&expires_at)?,
            last_refreshed_at: last_refreshed_at.as_deref().map(parse_timestamp).transpose()?,
            profile,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Deletes the credential record for a principal.
    ///
    /// Sessions bound to the principal are not touched here; the disconnect
    /// flow cascades through the session store separately.
    ///
    /// Returns `true` if a record existed.
    pub fn delete(&self, principal_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE principal_id = ?1",
                params![principal_id],
            )
            .context("Failed to delete credentials")?;

        Ok(rows > 0)
    }

    /// Overwrites token fields after a successful provider refresh.
    ///
    /// The stored refresh token is kept unless the provider rotated it, and
    /// `expires_at` never moves backwards.
    pub fn update_after_refresh(&self, principal_id: &str, tokens: &TokenSet) -> Result<()> {
        let access_blob = self
            .cipher
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt refreshed access token")?;

        let refresh_blob = match &tokens.refresh_token {
            Some(token) => Some(
                self.cipher
                    .encrypt(token)
                    .context("Failed to encrypt rotated refresh token")?,
            ),
            None => None,
        };

        let now = Utc::now();
        let new_expires_at = expiry_from(now, tokens.expires_in_secs)?;

        let conn = self.conn.lock().unwrap();

        let current_expires_at: String = conn
            .query_row(
                "SELECT expires_at FROM credentials WHERE principal_id = ?1",
                params![principal_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read current expiry")?
            .ok_or_else(|| anyhow!("No credential record for principal '{}'", principal_id))?;

        // expires_at is monotonically non-decreasing across updates
        let expires_at = new_expires_at.max(parse_timestamp(&current_expires_at)?);

        conn.execute(
            r#"
            UPDATE credentials SET
                access_token = ?2,
                refresh_token = COALESCE(?3, refresh_token),
                expires_at = ?4,
                last_refreshed_at = ?5,
                updated_at = ?5
            WHERE principal_id = ?1
            "#,
            params![
                principal_id,
                access_blob,
                refresh_blob,
                expires_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to persist refreshed credentials")?;

        Ok(())
    }

    /// Returns a usable access token for the principal, refreshing first when
    /// the stored token is inside the skew window.
    ///
    /// From the caller's view this is a single read: either a token that is
    /// valid for at least the skew duration comes back, or a
    /// [`TokenAccessError`] explains why one cannot be produced. A failed
    /// refresh is final for this attempt; there is no retry here.
    pub async fn get_valid_access_token(
        &self,
        principal_id: &str,
        oauth: &OauthClient,
    ) -> Result<String, TokenAccessError> {
        let record = self
            .get(principal_id)
            .map_err(TokenAccessError::Store)?
            .ok_or(TokenAccessError::NotConnected)?;

        if record.expires_at - Utc::now() >= self.refresh_skew {
            return Ok(record.access_token);
        }

        let refresh_token = record
            .refresh_token
            .ok_or(TokenAccessError::ReauthorizationRequired)?;

        info!(principal = %principal_id, "Access token inside skew window, refreshing");

        let tokens = oauth
            .refresh(&refresh_token)
            .await
            .map_err(TokenAccessError::RefreshFailed)?;

        let access_token = tokens.access_token.clone();

        self.update_after_refresh(principal_id, &tokens)
            .map_err(TokenAccessError::Store)?;

        info!(principal = %principal_id, "Access token refreshed and persisted");

        Ok(access_token)
    }

    /// Returns one page of principal ids, ordered for a stable scan.
    ///
    /// The sync orchestrator pages with this until a short page comes back.
    pub fn list_principals_page(&self, limit: usize, offset: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT principal_id FROM credentials ORDER BY principal_id LIMIT ?1 OFFSET ?2",
            )
            .context("Failed to prepare principal scan")?;

        let principals = stmt
            .query_map(params![limit as i64, offset as i64], |row| row.get(0))
            .context("Failed to scan principals")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read principal rows")?;

        Ok(principals)
    }
}

/// Computes `now + expires_in_secs` without trusting the provider-supplied
/// lifetime: an out-of-range value is an error, not a panic.
fn expiry_from(now: DateTime<Utc>, expires_in_secs: i64) -> Result<DateTime<Utc>> {
    let lifetime = Duration::try_seconds(expires_in_secs)
        .ok_or_else(|| anyhow!("Token lifetime out of range: {} seconds", expires_in_secs))?;

    now.checked_add_signed(lifetime)
        .ok_or_else(|| anyhow!("Token expiry out of range: {} seconds from now", expires_in_secs))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse stored timestamp '{}'", s))
}
