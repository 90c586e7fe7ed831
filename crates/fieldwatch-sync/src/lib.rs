//! Sync pipeline orchestration for Fieldwatch.
//!
//! One cycle runs entity fetch, image fetch, and response fetch strictly in
//! that order, normalizing and upserting as it goes, and reports counts when
//! done. Cycles never overlap: a mutex serializes them, while readers keep
//! hitting the store untouched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fieldwatch_adapters::{
    entities_endpoint, normalize_entities, reports_endpoint, resolve_images, resolve_responses,
    responses_endpoint,
};
use fieldwatch_core::{Image, Issue, Response};
use fieldwatch_storage::{RemoteClient, RemoteConfig, Store};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub api_email: String,
    pub api_password: String,
    pub project_id: String,
    pub db_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FIELDWATCH_BASE_URL")
                .unwrap_or_else(|_| "https://central.example.net".to_string()),
            api_email: std::env::var("FIELDWATCH_API_EMAIL").unwrap_or_default(),
            api_password: std::env::var("FIELDWATCH_API_PASSWORD").unwrap_or_default(),
            project_id: std::env::var("FIELDWATCH_PROJECT_ID").unwrap_or_else(|_| "2".to_string()),
            db_path: std::env::var("FIELDWATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fieldwatch.db")),
            scheduler_enabled: std::env::var("FIELDWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("FIELDWATCH_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            http_timeout_secs: std::env::var("FIELDWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Counts reported after each sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub issues_updated: usize,
    pub images_stored: usize,
    pub responses_stored: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    cycle_lock: Mutex<()>,
    events: broadcast::Sender<SyncRunSummary>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Store::open(&config.db_path).await?;
        let (events, _) = broadcast::channel(8);
        Ok(Self {
            config,
            store,
            cycle_lock: Mutex::new(()),
            events,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Completed-cycle notifications. Fire-and-forget: nobody listening is
    /// fine, and a lagging receiver only loses old summaries.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncRunSummary> {
        self.events.subscribe()
    }

    fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.config.base_url.clone(),
            email: self.config.api_email.clone(),
            password: self.config.api_password.clone(),
            timeout: Duration::from_secs(self.config.http_timeout_secs),
        }
    }

    /// Run one full sync cycle: entities, then images, then responses.
    ///
    /// Cycles are serialized; a second caller waits for the running cycle to
    /// finish instead of interleaving writes to the same ids. Authentication
    /// failure aborts the whole cycle, a failed list fetch abandons just that
    /// category, and a failed single record is skipped.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _cycle = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "sync cycle started");

        let client = RemoteClient::login(&self.remote_config())
            .await
            .context("authenticating against the remote API")?;

        let project_id = &self.config.project_id;

        let issues_updated = match client.get_json(&entities_endpoint(project_id)).await {
            Ok(payload) => {
                let issues = normalize_entities(&payload);
                apply_issues(&self.store, issues.values()).await
            }
            Err(error) => {
                error!(%run_id, %error, "entity fetch failed, skipping issues this cycle");
                0
            }
        };

        let images_stored = match client.get_json(&reports_endpoint(project_id)).await {
            Ok(payload) => {
                let images = resolve_images(&client, project_id, &payload).await;
                apply_images(&self.store, images.values()).await
            }
            Err(error) => {
                error!(%run_id, %error, "image fetch failed, skipping images this cycle");
                0
            }
        };

        let responses_stored = match client.get_json(&responses_endpoint(project_id)).await {
            Ok(payload) => {
                let responses = resolve_responses(&client, project_id, &payload).await;
                apply_responses(&self.store, responses.iter()).await
            }
            Err(error) => {
                error!(%run_id, %error, "response fetch failed, skipping responses this cycle");
                0
            }
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            issues_updated,
            images_stored,
            responses_stored,
        };
        info!(
            %run_id,
            issues = summary.issues_updated,
            images = summary.images_stored,
            responses = summary.responses_stored,
            "sync cycle finished"
        );
        let _ = self.events.send(summary.clone());
        Ok(summary)
    }

    /// Cron job re-invoking the pipeline (hourly by default), when enabled.
    /// Returns the started scheduler so the caller can keep it alive.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled sync triggered");
                if let Err(error) = pipeline.run_once().await {
                    error!(%error, "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating sync job for cron {cron}"))?;
        scheduler.add(job).await.context("adding sync job")?;
        scheduler.start().await.context("starting scheduler")?;
        Ok(Some(scheduler))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

/// Upsert a normalized issue batch; a failed record is logged and skipped.
pub async fn apply_issues<'a, I>(store: &Store, issues: I) -> usize
where
    I: IntoIterator<Item = &'a Issue>,
{
    let mut updated = 0;
    for issue in issues {
        match store.upsert_issue(issue).await {
            Ok(()) => updated += 1,
            Err(error) => error!(issue = %issue.id, %error, "issue upsert failed"),
        }
    }
    updated
}

/// Insert new images; duplicates are skipped silently and not counted.
pub async fn apply_images<'a, I>(store: &Store, images: I) -> usize
where
    I: IntoIterator<Item = &'a Image>,
{
    let mut stored = 0;
    for image in images {
        match store.insert_image(image).await {
            Ok(true) => stored += 1,
            Ok(false) => debug!(submission = %image.submission_id, "image already stored"),
            Err(error) => {
                error!(submission = %image.submission_id, %error, "image insert failed")
            }
        }
    }
    stored
}

/// Upsert a response batch; a failed record is logged and skipped.
pub async fn apply_responses<'a, I>(store: &Store, responses: I) -> usize
where
    I: IntoIterator<Item = &'a Response>,
{
    let mut stored = 0;
    for response in responses {
        match store.upsert_response(response).await {
            Ok(()) => stored += 1,
            Err(error) => error!(response = %response.key, %error, "response upsert failed"),
        }
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldwatch_storage::IssueFilter;
    use tempfile::tempdir;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("fieldwatch.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn mk_issue(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            label: format!("Issue {id}"),
            kind: "road".to_string(),
            description: "No Description".to_string(),
            severity: "Not Specified".to_string(),
            status: "new".to_string(),
            timeframe: "No Timeframe".to_string(),
            action_taken: "No Action Taken".to_string(),
            costusd: "0".to_string(),
            savedusd: "N/A".to_string(),
            recommended_contact: "No Contact".to_string(),
            latitude: None,
            longitude: None,
            created_at: "2024-05-14 10:30:00".to_string(),
            updated_at: "2024-05-14 10:30:00".to_string(),
            creator_id: "u1".to_string(),
            creator_name: "Enumerator".to_string(),
            version: "1".to_string(),
        }
    }

    fn mk_image(submission_id: &str) -> Image {
        Image {
            submission_id: submission_id.to_string(),
            title: format!("Issue {submission_id}"),
            label: None,
            image: vec![1, 2, 3],
        }
    }

    fn mk_response(key: &str, issue_id: &str) -> Response {
        Response {
            key: key.to_string(),
            submission_date: "2024-05-15 08:00:00".to_string(),
            entity_problem: Some(issue_id.to_string()),
            action_role: None,
            action_status: None,
            action_action_taken: None,
            action_image: None,
            action_resolution_costusd: None,
            action_resolution_timeframe: None,
            action_recommended_contact: None,
            submitter_name: None,
        }
    }

    #[tokio::test]
    async fn applying_the_same_batch_twice_converges() {
        let (_dir, store) = temp_store().await;
        let issues = [mk_issue("E1"), mk_issue("E2")];
        let images = [mk_image("S1")];
        let responses = [mk_response("R1", "E1")];

        let first = (
            apply_issues(&store, issues.iter()).await,
            apply_images(&store, images.iter()).await,
            apply_responses(&store, responses.iter()).await,
        );
        assert_eq!(first, (2, 1, 1));

        let second = (
            apply_issues(&store, issues.iter()).await,
            apply_images(&store, images.iter()).await,
            apply_responses(&store, responses.iter()).await,
        );
        // Issue and response upserts re-apply; the image stays first-write.
        assert_eq!(second, (2, 0, 1));

        let views = store.list_issues(&IssueFilter::default()).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(store.list_responses("E1").await.unwrap().len(), 1);
        assert_eq!(
            store.get_image("S1").await.unwrap().unwrap().image,
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn pipeline_exposes_store_and_notifications() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig {
            base_url: "https://central.example.net".to_string(),
            api_email: String::new(),
            api_password: String::new(),
            project_id: "2".to_string(),
            db_path: dir.path().join("fieldwatch.db"),
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".to_string(),
            http_timeout_secs: 5,
        };
        let pipeline = SyncPipeline::new(config).await.expect("pipeline");
        let mut events = pipeline.subscribe();

        apply_issues(pipeline.store(), [mk_issue("E1")].iter()).await;
        let views = pipeline
            .store()
            .list_issues(&IssueFilter::default())
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        // No cycle has completed, so nothing has been broadcast yet.
        assert!(events.try_recv().is_err());

        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            issues_updated: 1,
            images_stored: 0,
            responses_stored: 0,
        };
        pipeline.events.send(summary.clone()).expect("subscriber listening");
        let received = events.try_recv().expect("summary delivered");
        assert_eq!(received.run_id, summary.run_id);
        assert_eq!(received.issues_updated, 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig {
            base_url: "https://central.example.net".to_string(),
            api_email: String::new(),
            api_password: String::new(),
            project_id: "2".to_string(),
            db_path: dir.path().join("fieldwatch.db"),
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".to_string(),
            http_timeout_secs: 5,
        };
        let pipeline = Arc::new(SyncPipeline::new(config).await.expect("pipeline"));
        assert!(pipeline.clone().maybe_build_scheduler().await.unwrap().is_none());
    }
}
