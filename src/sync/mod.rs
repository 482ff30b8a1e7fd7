//! Batch sync orchestration.
//!
//! One run walks every credential record, refreshes tokens as needed through
//! the credential store, pulls analytics for each principal, appends a
//! snapshot, and finalizes a sync log with the overall outcome.
//!
//! Per-principal isolation is the core correctness property here: one
//! principal's refresh failure, analytics failure, or malformed record never
//! aborts the batch and never corrupts the running counts.

use crate::credentials::CredentialStore;
use crate::provider::{AnalyticsClient, OauthClient};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

pub mod log;
pub mod snapshot;

pub use log::{SyncLog, SyncLogStore, SyncOutcome, SyncStatus, TriggerType};
pub use snapshot::{AnalyticsSnapshot, SnapshotStore};

/// Page size for the credential scan.
const SCAN_PAGE_SIZE: usize = 100;

/// Orchestration knobs, all externally supplied.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Trailing reporting window in days, computed once per run
    pub window_days: i64,
    /// How many principals are processed concurrently
    pub parallelism: usize,
    /// Hard cap per principal so one unresponsive provider call cannot stall
    /// the whole run
    pub principal_timeout: StdDuration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            window_days: 7,
            parallelism: 4,
            principal_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Summary returned to the caller that triggered the run.
#[derive(Clone, Debug, Serialize)]
pub struct SyncSummary {
    pub job_id: String,
    pub status: SyncStatus,
    pub total_users: usize,
    pub success_count: usize,
    pub error_count: usize,
}

#[derive(Clone, Default)]
struct RunTally {
    success_count: usize,
    error_count: usize,
    errors: Vec<String>,
    success_details: Vec<String>,
}

/// The batch sync engine.
///
/// Holds handles to the stores and provider clients; a single instance serves
/// every run. Runs are triggered one at a time by an external scheduler or a
/// manual call.
pub struct SyncEngine {
    credentials: Arc<CredentialStore>,
    snapshots: Arc<SnapshotStore>,
    sync_log: Arc<SyncLogStore>,
    oauth: Arc<OauthClient>,
    analytics: Arc<AnalyticsClient>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        credentials: Arc<CredentialStore>,
        snapshots: Arc<SnapshotStore>,
        sync_log: Arc<SyncLogStore>,
        oauth: Arc<OauthClient>,
        analytics: Arc<AnalyticsClient>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            credentials,
            snapshots,
            sync_log,
            oauth,
            analytics,
            settings,
        }
    }

    /// Runs one sync job to completion and returns its summary.
    ///
    /// The sync log is opened before any work and finalized exactly once
    /// after every principal's task has settled. If the process dies mid-run
    /// the log stays `running`; the next run is independent under a fresh job
    /// id.
    pub async fn run(&self, trigger: TriggerType) -> Result<SyncSummary> {
        let job_id = self.sync_log.start(trigger)?;
        info!(job = %job_id, trigger = trigger.as_str(), "Sync run started");

        let principals = self.scan_principals()?;
        let total_users = principals.len();

        // One reporting window for the whole run, inclusive on both ends
        let range_end = Utc::now().date_naive();
        let range_start = range_end - Duration::days(self.settings.window_days - 1);

        let tally = Arc::new(tokio::sync::Mutex::new(RunTally::default()));

        futures::stream::iter(principals)
            .map(|principal_id| {
                let tally = Arc::clone(&tally);
                async move {
                    let result = tokio::time::timeout(
                        self.settings.principal_timeout,
                        self.process_principal(&principal_id, range_start, range_end),
                    )
                    .await;

                    let mut tally = tally.lock().await;
                    match result {
                        Ok(Ok(summary)) => {
                            tally.success_count += 1;
                            tally.success_details.push(summary);
                        }
                        Ok(Err(e)) => {
                            warn!(principal = %principal_id, error = %e, "Principal sync failed");
                            tally.error_count += 1;
                            tally.errors.push(format!("{}: {:#}", principal_id, e));
                        }
                        Err(_) => {
                            warn!(principal = %principal_id, "Principal sync timed out");
                            tally.error_count += 1;
                            tally.errors.push(format!(
                                "{}: timed out after {}s",
                                principal_id,
                                self.settings.principal_timeout.as_secs()
                            ));
                        }
                    }
                }
            })
            .buffer_unordered(self.settings.parallelism.max(1))
            .collect::<Vec<()>>()
            .await;

        let tally = tally.lock().await.clone();
        let outcome = SyncOutcome {
            total_users,
            success_count: tally.success_count,
            error_count: tally.error_count,
            errors: tally.errors,
            success_details: tally.success_details,
        };

        if !self.sync_log.finalize(&job_id, &outcome)? {
            warn!(job = %job_id, "Sync log was not in running state at finalize");
        }

        let status = SyncStatus::from_counts(
            outcome.total_users,
            outcome.success_count,
            outcome.error_count,
        );

        info!(
            job = %job_id,
            status = status.as_str(),
            total = outcome.total_users,
            succeeded = outcome.success_count,
            failed = outcome.error_count,
            "Sync run finished"
        );

        Ok(SyncSummary {
            job_id,
            status,
            total_users: outcome.total_users,
            success_count: outcome.success_count,
            error_count: outcome.error_count,
        })
    }

    /// Pages through the credential store to completion.
    fn scan_principals(&self) -> Result<Vec<String>> {
        let mut principals = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .credentials
                .list_principals_page(SCAN_PAGE_SIZE, offset)
                .context("Failed to scan credential records")?;
            let page_len = page.len();
            principals.extend(page);

            if page_len < SCAN_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        Ok(principals)
    }

    /// Processes a single principal; every failure is returned, never raised
    /// past the per-principal boundary in `run`.
    async fn process_principal(
        &self,
        principal_id: &str,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<String> {
        let record = self
            .credentials
            .get(principal_id)
            .context("failed to load credential record")?
            .ok_or_else(|| anyhow!("credential record disappeared during run"))?;

        let Some(remote_subject_id) = record.remote_subject_id else {
            return Err(anyhow!("no remote account id cached; reconnect required"));
        };

        let access_token = self
            .credentials
            .get_valid_access_token(principal_id, &self.oauth)
            .await
            .map_err(|e| anyhow!("{}", e))?;

        let payload = self
            .analytics
            .fetch_analytics(&access_token, &remote_subject_id, range_start, range_end)
            .await
            .context("analytics fetch failed")?;

        let snapshot = AnalyticsSnapshot::aggregate(
            principal_id,
            &remote_subject_id,
            range_start,
            range_end,
            &payload,
        );

        let summary = format!(
            "{}: {} posts, {} impressions, {} engagements",
            principal_id, snapshot.post_count, snapshot.impressions, snapshot.engagements
        );

        self.snapshots
            .append(&snapshot)
            .context("failed to persist snapshot")?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Cipher, TokenSet};
    use crate::provider::ProviderConfig;

    const TEST_KEY: &str =
        "000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f";

    const ANALYTICS_BODY: &str = r#"{
        "elements": [
            {"impressionCount": 100, "uniqueImpressionsCount": 80,
             "reactionCount": 10, "commentCount": 3, "shareCount": 2,
             "clickCount": 5, "engagementCount": 20}
        ],
        "paging": {"start": 0, "count": 1, "total": 1}
    }"#;

    struct TestHarness {
        engine: SyncEngine,
        credentials: Arc<CredentialStore>,
        snapshots: Arc<SnapshotStore>,
        sync_log: Arc<SyncLogStore>,
    }

    fn harness(server: &mockito::Server, settings: SyncSettings) -> TestHarness {
        let config = ProviderConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            oauth_base_url: format!("{}/oauth/v2", server.url()),
            api_base_url: server.url(),
        };

        let credentials = Arc::new(
            CredentialStore::new(
                ":memory:",
                Cipher::new(TEST_KEY).unwrap(),
                Duration::minutes(5),
            )
            .unwrap(),
        );
        let snapshots = Arc::new(SnapshotStore::new(":memory:").unwrap());
        let sync_log = Arc::new(SyncLogStore::new(":memory:").unwrap());

        let engine = SyncEngine::new(
            Arc::clone(&credentials),
            Arc::clone(&snapshots),
            Arc::clone(&sync_log),
            Arc::new(OauthClient::new(config.clone())),
            Arc::new(AnalyticsClient::new(&config)),
            settings,
        );

        TestHarness {
            engine,
            credentials,
            snapshots,
            sync_log,
        }
    }

    fn fresh_tokens() -> TokenSet {
        TokenSet {
            access_token: "fresh-access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_in_secs: 3600,
        }
    }

    async fn analytics_mock(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock(
                "GET",
                mockito::Matcher::Regex(r"^/rest/memberPostAnalytics\?.*".to_string()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(ANALYTICS_BODY)
            .expect_at_least(0)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_run_with_no_principals_completes() {
        let server = mockito::Server::new_async().await;
        let h = harness(&server, SyncSettings::default());

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Completed);
        assert_eq!(summary.total_users, 0);
        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.error_count, 0);
    }

    #[tokio::test]
    async fn test_run_all_success_is_completed() {
        let mut server = mockito::Server::new_async().await;
        analytics_mock(&mut server).await;

        let h = harness(&server, SyncSettings::default());
        h.credentials
            .put("p1", Some("urn:member:1"), &fresh_tokens(), None)
            .unwrap();
        h.credentials
            .put("p2", Some("urn:member:2"), &fresh_tokens(), None)
            .unwrap();

        let summary = h.engine.run(TriggerType::Manual).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Completed);
        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.error_count, 0);

        // One snapshot per principal
        assert_eq!(h.snapshots.count_for_principal("p1").unwrap(), 1);
        assert_eq!(h.snapshots.count_for_principal("p2").unwrap(), 1);

        let log = h.sync_log.get(&summary.job_id).unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.trigger, TriggerType::Manual);
        assert_eq!(log.success_details.len(), 2);
        assert!(log.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_run_mixed_is_partial_and_isolated() {
        let mut server = mockito::Server::new_async().await;
        analytics_mock(&mut server).await;

        let h = harness(&server, SyncSettings::default());

        // p1: healthy
        h.credentials
            .put("p1", Some("urn:member:1"), &fresh_tokens(), None)
            .unwrap();
        // p2: connected but no remote account id cached
        h.credentials.put("p2", None, &fresh_tokens(), None).unwrap();
        // p3: expired with no refresh token, needs re-authorization
        h.credentials
            .put(
                "p3",
                Some("urn:member:3"),
                &TokenSet {
                    access_token: "stale".to_string(),
                    refresh_token: None,
                    expires_in_secs: 60,
                },
                None,
            )
            .unwrap();

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Partial);
        assert_eq!(summary.total_users, 3);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 2);

        let log = h.sync_log.get(&summary.job_id).unwrap().unwrap();
        assert_eq!(log.errors.len(), 2);
        assert!(log.errors.iter().any(|e| e.starts_with("p2:")));
        assert!(log
            .errors
            .iter()
            .any(|e| e.starts_with("p3:") && e.contains("re-authorization")));

        // The healthy principal still produced a snapshot
        assert_eq!(h.snapshots.count_for_principal("p1").unwrap(), 1);
        assert_eq!(h.snapshots.count_for_principal("p2").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_all_failures_is_failed() {
        let server = mockito::Server::new_async().await;
        let h = harness(&server, SyncSettings::default());

        h.credentials.put("p1", None, &fresh_tokens(), None).unwrap();
        h.credentials.put("p2", None, &fresh_tokens(), None).unwrap();

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Failed);
        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.error_count, 2);
    }

    #[tokio::test]
    async fn test_run_refreshes_expiring_token() {
        let mut server = mockito::Server::new_async().await;
        analytics_mock(&mut server).await;
        let refresh_mock = server
            .mock("POST", "/oauth/v2/accessToken")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"refreshed","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let h = harness(&server, SyncSettings::default());
        // Expires in 2 minutes, inside the 5-minute skew
        h.credentials
            .put(
                "p1",
                Some("urn:member:1"),
                &TokenSet {
                    access_token: "expiring".to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_in_secs: 120,
                },
                None,
            )
            .unwrap();

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Completed);
        refresh_mock.assert_async().await;

        let record = h.credentials.get("p1").unwrap().unwrap();
        assert_eq!(record.access_token, "refreshed");
        assert!(record.last_refreshed_at.is_some());
    }

    #[tokio::test]
    async fn test_analytics_failure_does_not_abort_batch() {
        let mut server = mockito::Server::new_async().await;
        // Analytics fails for member 1, succeeds for member 2
        server
            .mock(
                "GET",
                mockito::Matcher::Regex(r"^/rest/memberPostAnalytics\?author=urn%3Amember%3A1.*".to_string()),
            )
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        server
            .mock(
                "GET",
                mockito::Matcher::Regex(r"^/rest/memberPostAnalytics\?author=urn%3Amember%3A2.*".to_string()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(ANALYTICS_BODY)
            .create_async()
            .await;

        let h = harness(&server, SyncSettings::default());
        h.credentials
            .put("p1", Some("urn:member:1"), &fresh_tokens(), None)
            .unwrap();
        h.credentials
            .put("p2", Some("urn:member:2"), &fresh_tokens(), None)
            .unwrap();

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Partial);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(h.snapshots.count_for_principal("p2").unwrap(), 1);
        assert_eq!(h.snapshots.count_for_principal("p1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_per_principal_timeout_is_recorded() {
        let mut server = mockito::Server::new_async().await;
        analytics_mock(&mut server).await;

        let settings = SyncSettings {
            principal_timeout: StdDuration::ZERO,
            ..Default::default()
        };
        let h = harness(&server, settings);
        h.credentials
            .put("p1", Some("urn:member:1"), &fresh_tokens(), None)
            .unwrap();

        let summary = h.engine.run(TriggerType::Scheduled).await.unwrap();

        assert_eq!(summary.status, SyncStatus::Failed);
        let log = h.sync_log.get(&summary.job_id).unwrap().unwrap();
        assert!(log.errors[0].contains("timed out"));
    }
}
