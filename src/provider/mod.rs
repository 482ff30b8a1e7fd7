//! Remote provider clients.
//!
//! Two seams to the professional-network provider: the OAuth token endpoint
//! (code exchange, refresh, profile fetch) and the analytics REST API. Both
//! take their base URLs from [`ProviderConfig`] so tests can point them at a
//! mock server.

pub mod analytics;
pub mod oauth;

pub use analytics::{AnalyticsClient, AnalyticsPayload, PostStats};
pub use oauth::OauthClient;

/// Provider endpoints and client credentials.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// OAuth client ID (from environment)
    pub client_id: String,

    /// OAuth client secret (from environment)
    pub client_secret: String,

    /// OAuth base URL, e.g. "https://www.linkedin.com/oauth/v2"
    pub oauth_base_url: String,

    /// REST API base URL, e.g. "https://api.linkedin.com"
    pub api_base_url: String,
}
