//! Analytics fetcher for per-post engagement statistics.
//!
//! The provider grants the precise per-post analytics scope inconsistently
//! across accounts, so the fetch is two-tier: try the precise endpoint first,
//! and on HTTP 403 degrade to the coarser share-statistics endpoint rather
//! than failing the principal. Any other non-2xx status is an error.

use super::ProviderConfig;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

/// Normalized per-post engagement statistics.
///
/// Both the precise and the fallback endpoint are mapped into this shape so
/// downstream aggregation does not care which path produced the data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PostStats {
    pub impressions: i64,
    pub unique_views: i64,
    pub reactions: i64,
    pub comments: i64,
    pub shares: i64,
    pub clicks: i64,
    pub engagements: i64,
}

/// One analytics fetch result: normalized posts, a paging indicator, and the
/// raw provider payload retained for audit.
#[derive(Clone, Debug)]
pub struct AnalyticsPayload {
    pub posts: Vec<PostStats>,
    pub has_more: bool,
    pub raw: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct Paging {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    count: i64,
    #[serde(default)]
    total: i64,
}

impl Paging {
    fn has_more(&self) -> bool {
        self.total > 0 && self.start + self.count < self.total
    }
}

/// Precise endpoint: one element per post with full engagement counters
#[derive(Deserialize)]
struct PostAnalyticsResponse {
    #[serde(default)]
    elements: Vec<PostAnalyticsElement>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PostAnalyticsElement {
    impression_count: i64,
    unique_impressions_count: i64,
    reaction_count: i64,
    comment_count: i64,
    share_count: i64,
    click_count: i64,
    engagement_count: i64,
}

/// Fallback endpoint: share list with aggregate counters, no engagement total
#[derive(Deserialize)]
struct ShareStatisticsResponse {
    #[serde(default)]
    elements: Vec<ShareStatisticsElement>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ShareStatisticsElement {
    #[serde(default)]
    total_share_statistics: ShareCounts,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ShareCounts {
    impression_count: i64,
    unique_impressions_count: i64,
    like_count: i64,
    comment_count: i64,
    share_count: i64,
    click_count: i64,
}

/// Client for the provider's analytics REST API.
pub struct AnalyticsClient {
    api_base_url: String,
    http: reqwest::Client,
}

impl AnalyticsClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetches post engagement statistics for one principal over a date
    /// window (inclusive on both ends).
    ///
    /// 403 from the precise endpoint means the account lacks the analytics
    /// scope; the coarser share-statistics endpoint is tried instead. No
    /// retry on either path.
    pub async fn fetch_analytics(
        &self,
        access_token: &str,
        remote_subject_id: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<AnalyticsPayload> {
        let url = format!(
            "{}/rest/memberPostAnalytics?author={}&dateRange.start={}&dateRange.end={}",
            self.api_base_url,
            urlencoding::encode(remote_subject_id),
            range_start,
            range_end
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send analytics request")?;

        let status = response.status();

        if status == reqwest::StatusCode::FORBIDDEN {
            warn!(
                subject = %remote_subject_id,
                "Post analytics endpoint returned 403, falling back to share statistics"
            );
            return self
                .fetch_share_statistics(access_token, remote_subject_id, range_start, range_end)
                .await;
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(anyhow!("Analytics endpoint returned {}: {}", status, body));
        }

        let body = response
            .text()
            .await
            .context("Failed to read analytics response")?;
        let raw: serde_json::Value =
            serde_json::from_str(&body).context("Analytics response is not valid JSON")?;
        let parsed: PostAnalyticsResponse =
            serde_json::from_str(&body).context("Failed to parse analytics response")?;

        debug!(
            subject = %remote_subject_id,
            post_count = parsed.elements.len(),
            "Fetched post analytics"
        );

        let posts = parsed
            .elements
            .into_iter()
            .map(|e| PostStats {
                impressions: e.impression_count,
                unique_views: e.unique_impressions_count,
                reactions: e.reaction_count,
                comments: e.comment_count,
                shares: e.share_count,
                clicks: e.click_count,
                engagements: e.engagement_count,
            })
            .collect();

        Ok(AnalyticsPayload {
            posts,
            has_more: parsed.paging.has_more(),
            raw,
        })
    }

    /// Coarser fallback used when the precise analytics scope is missing.
    ///
    /// The share endpoint has no engagement total, so one is derived from the
    /// counters it does return.
    async fn fetch_share_statistics(
        &self,
        access_token: &str,
        remote_subject_id: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<AnalyticsPayload> {
        let url = format!(
            "{}/rest/memberShareStatistics?owner={}&dateRange.start={}&dateRange.end={}",
            self.api_base_url,
            urlencoding::encode(remote_subject_id),
            range_start,
            range_end
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send share statistics request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(anyhow!(
                "Share statistics endpoint returned {}: {}",
                status,
                body
            ));
        }

        let body = response
            .text()
            .await
            .context("Failed to read share statistics response")?;
        let raw: serde_json::Value =
            serde_json::from_str(&body).context("Share statistics response is not valid JSON")?;
        let parsed: ShareStatisticsResponse =
            serde_json::from_str(&body).context("Failed to parse share statistics response")?;

        debug!(
            subject = %remote_subject_id,
            post_count = parsed.elements.len(),
            "Fetched share statistics (fallback)"
        );

        let posts = parsed
            .elements
            .into_iter()
            .map(|e| {
                let c = e.total_share_statistics;
                PostStats {
                    impressions: c.impression_count,
                    unique_views: c.unique_impressions_count,
                    reactions: c.like_count,
                    comments: c.comment_count,
                    shares: c.share_count,
                    clicks: c.click_count,
                    engagements: c.like_count + c.comment_count + c.share_count + c.click_count,
                }
            })
            .collect();

        Ok(AnalyticsPayload {
            posts,
            has_more: parsed.paging.has_more(),
            raw,
        })
    }
}
