//! Encrypted credential storage for connected principals.
//!
//! This module owns the per-principal OAuth token record: AES-256-GCM
//! encryption of tokens at rest, the SQLite-backed store, and the
//! refresh-ahead read path that never hands an expired access token to a
//! caller.
//!
//! # Security
//!
//! - Access and refresh tokens are encrypted at rest, each blob carrying its
//!   own random nonce
//! - The master key lives in memory only (from the environment) and is
//!   validated once at startup
//! - Decrypted tokens exist only in the in-memory [`CredentialRecord`]
//!   returned to the caller and are never written back anywhere

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod cipher;
mod store;

pub use cipher::{Cipher, CipherError};
pub use store::{CredentialStore, TokenAccessError};

/// A token set as issued by the provider's token endpoint.
#[derive(Clone, Debug)]
pub struct TokenSet {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token; providers that do not rotate omit it on refresh
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds, relative to issuance
    pub expires_in_secs: i64,
}

/// Cached provider profile for a principal.
///
/// Purely display data fetched once at connect time; refreshed only when the
/// principal reconnects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
}

/// One principal's decrypted credential record.
///
/// Tokens in this struct are plaintext and must stay in memory; the store is
/// the only place they are persisted, and only in encrypted form.
#[derive(Clone, Debug)]
pub struct CredentialRecord {
    pub principal_id: String,

    /// External account identifier; absent until the first profile fetch
    pub remote_subject_id: Option<String>,

    pub access_token: String,
    pub refresh_token: Option<String>,

    /// When the access token stops being valid
    pub expires_at: DateTime<Utc>,

    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub profile: Option<ProfileSummary>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
