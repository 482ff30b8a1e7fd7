//! OAuth client for the provider's token and profile endpoints.
//!
//! Covers the three interactive calls: authorization-code exchange at connect
//! time, refresh-token grants driven by the credential store, and the profile
//! fetch that caches display data and the remote subject id.

use super::ProviderConfig;
use crate::credentials::{ProfileSummary, TokenSet};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// OAuth scopes requested at authorization time.
const SCOPES: &[&str] = &["openid", "profile", "w_member_social", "r_member_postAnalytics"];

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Provider error body, returned with non-2xx token responses
#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// OIDC userinfo response
#[derive(Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    headline: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Client for the provider's OAuth endpoints.
pub struct OauthClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OauthClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Builds the authorization URL the principal is redirected to.
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = SCOPES.join(" ");
        format!(
            "{}/authorization?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.oauth_base_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }

    /// Exchanges an authorization code for a token set.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        debug!("Exchanging authorization code for token");
        self.post_token_request(form).await
    }

    /// Obtains a fresh token set from a refresh token.
    ///
    /// Single POST, no retry: a failed refresh propagates immediately and the
    /// caller decides what that means for the principal.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        debug!("Refreshing access token");
        self.post_token_request(form).await
    }

    async fn post_token_request(&self, form: HashMap<&str, &str>) -> Result<TokenSet> {
        let url = format!("{}/accessToken", self.config.oauth_base_url);

        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Failed to send token request")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Token endpoint returned {}",
                describe_error(response).await
            ));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = token_response.expires_in,
            "Token request successful"
        );

        Ok(TokenSet {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in_secs: token_response.expires_in,
        })
    }

    /// Fetches the principal's profile, returning the remote subject id and
    /// the display fields worth caching.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<(String, ProfileSummary)> {
        let url = format!("{}/v2/userinfo", self.config.api_base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send profile request")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Profile endpoint returned {}",
                describe_error(response).await
            ));
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .context("Failed to parse profile response")?;

        let profile = ProfileSummary {
            first_name: info.given_name.unwrap_or_default(),
            last_name: info.family_name.unwrap_or_default(),
            headline: info.headline,
            picture_url: info.picture,
        };

        Ok((info.sub, profile))
    }
}

/// Formats a non-2xx response as "status: description", preferring the
/// provider's `error_description` over the raw body.
async fn describe_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());

    if let Ok(err) = serde_json::from_str::<ProviderErrorBody>(&body) {
        if let Some(description) = err.error_description {
            return format!("{}: {}", status, description);
        }
        if let Some(code) = err.error {
            return format!("{}: {}", status, code);
        }
    }

    format!("{}: {}", status, body)
}
