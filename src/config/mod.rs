//! Configuration loaded from the environment.
//!
//! Everything is validated at startup so a bad cipher key or missing client
//! secret fails the process before any request is served. All variables are
//! prefixed `PULSE_`.

use crate::credentials::Cipher;
use crate::provider::ProviderConfig;
use crate::sync::SyncSettings;
use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

const DEFAULT_OAUTH_BASE_URL: &str = "https://www.linkedin.com/oauth/v2";
const DEFAULT_API_BASE_URL: &str = "https://api.linkedin.com";

/// Validated process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the SQLite database files
    pub data_dir: PathBuf,

    /// HTTP listen address
    pub bind_addr: String,

    /// Token cipher, already validated against the master key
    pub cipher: Cipher,

    pub provider: ProviderConfig,

    /// Fixed session lifetime
    pub session_ttl: Duration,

    /// Lead time before expiry at which access tokens are refreshed
    pub refresh_skew: Duration,

    pub sync: SyncSettings,

    /// Interval between scheduled sync runs
    pub sync_interval: StdDuration,
}

impl Config {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary lookup, so tests do not have to
    /// mutate process-global environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let key = lookup("PULSE_ENCRYPTION_KEY")
            .ok_or_else(|| anyhow!("PULSE_ENCRYPTION_KEY is not set"))?;
        let cipher = Cipher::new(&key).context("PULSE_ENCRYPTION_KEY is invalid")?;

        let client_id = lookup("PULSE_PROVIDER_CLIENT_ID")
            .ok_or_else(|| anyhow!("PULSE_PROVIDER_CLIENT_ID is not set"))?;
        let client_secret = lookup("PULSE_PROVIDER_CLIENT_SECRET")
            .ok_or_else(|| anyhow!("PULSE_PROVIDER_CLIENT_SECRET is not set"))?;

        let provider = ProviderConfig {
            client_id,
            client_secret,
            oauth_base_url: lookup("PULSE_PROVIDER_OAUTH_URL")
                .unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_string()),
            api_base_url: lookup("PULSE_PROVIDER_API_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        };

        let session_ttl_hours: i64 = parse_or(&lookup, "PULSE_SESSION_TTL_HOURS", 24)?;
        let refresh_skew_minutes: i64 = parse_or(&lookup, "PULSE_REFRESH_SKEW_MINUTES", 5)?;
        let window_days: i64 = parse_or(&lookup, "PULSE_REPORT_WINDOW_DAYS", 7)?;
        let parallelism: usize = parse_or(&lookup, "PULSE_SYNC_PARALLELISM", 4)?;
        let timeout_secs: u64 = parse_or(&lookup, "PULSE_SYNC_TIMEOUT_SECS", 30)?;
        let interval_minutes: u64 = parse_or(&lookup, "PULSE_SYNC_INTERVAL_MINUTES", 60)?;

        if session_ttl_hours <= 0 {
            return Err(anyhow!("PULSE_SESSION_TTL_HOURS must be positive"));
        }
        if refresh_skew_minutes <= 0 {
            return Err(anyhow!("PULSE_REFRESH_SKEW_MINUTES must be positive"));
        }
        if window_days <= 0 {
            return Err(anyhow!("PULSE_REPORT_WINDOW_DAYS must be positive"));
        }
        if timeout_secs == 0 {
            return Err(anyhow!("PULSE_SYNC_TIMEOUT_SECS must be positive"));
        }
        if interval_minutes == 0 {
            return Err(anyhow!("PULSE_SYNC_INTERVAL_MINUTES must be positive"));
        }

        Ok(Self {
            data_dir: lookup("PULSE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            bind_addr: lookup("PULSE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            cipher,
            provider,
            session_ttl: Duration::hours(session_ttl_hours),
            refresh_skew: Duration::minutes(refresh_skew_minutes),
            sync: SyncSettings {
                window_days,
                parallelism,
                principal_timeout: StdDuration::from_secs(timeout_secs),
            },
            sync_interval: StdDuration::from_secs(interval_minutes * 60),
        })
    }
}

fn parse_or<T>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} is not a valid value: {}", name, e)),
        None => Ok(default),
    }
}
