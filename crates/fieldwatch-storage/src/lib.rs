//! SQLite row store + ODK Central HTTP client for Fieldwatch.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fieldwatch_core::{effective_status, Image, Issue, IssueView, Response, ResponseView};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "fieldwatch-storage";

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("login response carried no session token")]
    MissingToken,
}

/// Authenticated client for one sync cycle. Constructed by [`RemoteClient::login`]
/// and passed by reference to whatever needs attachment access; there is no
/// process-wide session.
#[derive(Debug)]
pub struct RemoteClient {
    base_url: String,
    client: reqwest::Client,
    token: String,
}

impl RemoteClient {
    /// Exchange credentials for a bearer token. A sync cycle cannot proceed
    /// without a session, so every failure propagates.
    pub async fn login(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        let url = join_url(&config.base_url, "v1/sessions");
        debug!(%url, "requesting session token");
        let response = client
            .post(&url)
            .json(&serde_json::json!({ "email": config.email, "password": config.password }))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: JsonValue = response.json().await?;
        let token = body
            .get("token")
            .and_then(JsonValue::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(RemoteError::MissingToken)?
            .to_string();
        info!(base_url = %config.base_url, "remote session established");
        Ok(Self {
            base_url: config.base_url.clone(),
            client,
            token,
        })
    }

    /// GET an endpoint as parsed JSON.
    pub async fn get_json(&self, endpoint: &str) -> Result<JsonValue, RemoteError> {
        let response = self.get(endpoint).await?;
        Ok(response.json().await?)
    }

    /// GET an endpoint as raw bytes (attachment downloads).
    pub async fn get_bytes(&self, endpoint: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self.get(endpoint).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get(&self, endpoint: &str) -> Result<reqwest::Response, RemoteError> {
        let url = join_url(&self.base_url, endpoint);
        debug!(%url, "remote GET");
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        check_status(response).await
    }
}

fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Non-2xx responses become errors carrying whatever body text the server
/// returned, for diagnostics.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::HttpStatus {
        status: status.as_u16(),
        url,
        body,
    })
}

/// Read-side filter set for [`Store::list_issues`]. Empty or whitespace-only
/// values are treated as unset; supplied predicates combine with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueFilter {
    pub search: Option<String>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub timeframe: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Keyed row store over issues, images, and responses. Every write is one
/// record, one statement; there is no batch transaction, so a crash mid-batch
/// leaves a durable prefix and the next cycle converges.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `db_path` and ensure the
    /// schema exists. Safe to call repeatedly.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.create_schema().await?;
        info!(path = %db_path.display(), "store opened");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                type TEXT NOT NULL,
                description TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                costusd TEXT NOT NULL,
                savedusd TEXT NOT NULL,
                recommended_contact TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                creator_name TEXT NOT NULL,
                version TEXT NOT NULL,
                CHECK ((latitude IS NULL) = (longitude IS NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating issues table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                submission_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                label TEXT,
                image BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating images table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                "key" TEXT PRIMARY KEY,
                submission_date TEXT NOT NULL,
                entity_problem TEXT,
                action_role TEXT,
                action_status TEXT,
                action_action_taken TEXT,
                action_image BLOB,
                action_resolution_costusd TEXT,
                action_resolution_timeframe TEXT,
                action_recommended_contact TEXT,
                submitter_name TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating responses table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_title ON images(title)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_responses_entity ON responses(entity_problem)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Full-row replace keyed by issue id.
    pub async fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO issues (
                id, label, type, description, severity, status, timeframe, action_taken,
                costusd, savedusd, recommended_contact, latitude, longitude,
                created_at, updated_at, creator_id, creator_name, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&issue.id)
        .bind(&issue.label)
        .bind(&issue.kind)
        .bind(&issue.description)
        .bind(&issue.severity)
        .bind(&issue.status)
        .bind(&issue.timeframe)
        .bind(&issue.action_taken)
        .bind(&issue.costusd)
        .bind(&issue.savedusd)
        .bind(&issue.recommended_contact)
        .bind(issue.latitude)
        .bind(issue.longitude)
        .bind(&issue.created_at)
        .bind(&issue.updated_at)
        .bind(&issue.creator_id)
        .bind(&issue.creator_name)
        .bind(&issue.version)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting issue {}", issue.id))?;
        Ok(())
    }

    /// First-write-wins insert keyed by submission id. Returns whether a row
    /// was actually written; a duplicate is silently ignored.
    pub async fn insert_image(&self, image: &Image) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO images (submission_id, title, label, image) VALUES (?, ?, ?, ?)",
        )
        .bind(&image.submission_id)
        .bind(&image.title)
        .bind(image.label.as_deref())
        .bind(image.image.as_slice())
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting image for submission {}", image.submission_id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Full-row replace keyed by the upstream submission key.
    pub async fn upsert_response(&self, response: &Response) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO responses (
                "key", submission_date, entity_problem, action_role, action_status,
                action_action_taken, action_image, action_resolution_costusd,
                action_resolution_timeframe, action_recommended_contact, submitter_name
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&response.key)
        .bind(&response.submission_date)
        .bind(response.entity_problem.as_deref())
        .bind(response.action_role.as_deref())
        .bind(response.action_status.as_deref())
        .bind(response.action_action_taken.as_deref())
        .bind(response.action_image.as_deref())
        .bind(response.action_resolution_costusd.as_deref())
        .bind(response.action_resolution_timeframe.as_deref())
        .bind(response.action_recommended_contact.as_deref())
        .bind(response.submitter_name.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting response {}", response.key))?;
        Ok(())
    }

    pub async fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let row = sqlx::query(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading issue {id}"))?;
        row.as_ref().map(issue_from_row).transpose()
    }

    pub async fn get_image(&self, submission_id: &str) -> Result<Option<Image>> {
        let row = sqlx::query(
            "SELECT submission_id, title, label, image FROM images WHERE submission_id = ?",
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reading image for submission {submission_id}"))?;
        row.map(|row| {
            Ok(Image {
                submission_id: row.try_get("submission_id")?,
                title: row.try_get("title")?,
                label: row.try_get("label")?,
                image: row.try_get("image")?,
            })
        })
        .transpose()
    }

    /// `MAX(updated_at)` across all issues; `None` when the store is empty.
    pub async fn latest_update_time(&self) -> Result<Option<String>> {
        let latest: Option<String> = sqlx::query_scalar("SELECT MAX(updated_at) FROM issues")
            .fetch_one(&self.pool)
            .await
            .context("reading latest update time")?;
        Ok(latest)
    }

    /// Filtered, image-joined read view over issues.
    ///
    /// Issues join images by `label == title` — a soft string match, kept as
    /// such because upstream never guarantees label uniqueness. Status is
    /// recomputed at read time: no responses forces `new`, and stored values
    /// outside the vocabulary collapse to `new`.
    pub async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<IssueView>> {
        let mut sql = format!(
            "SELECT {ISSUE_COLUMNS}, images.image AS image, \
             EXISTS(SELECT 1 FROM responses WHERE responses.entity_problem = issues.id) AS has_responses \
             FROM issues LEFT JOIN images ON issues.label = images.title WHERE 1=1"
        );
        let mut params: Vec<String> = Vec::new();

        if let Some(search) = nonempty(&filter.search) {
            sql.push_str(
                " AND (instr(lower(issues.label), ?) > 0 \
                 OR instr(lower(issues.description), ?) > 0 \
                 OR instr(lower(issues.type), ?) > 0)",
            );
            let needle = search.to_lowercase();
            params.extend([needle.clone(), needle.clone(), needle]);
        }
        for (column, value) in [
            ("status", &filter.status),
            ("severity", &filter.severity),
            ("timeframe", &filter.timeframe),
        ] {
            if let Some(value) = nonempty(value) {
                sql.push_str(&format!(" AND lower(issues.{column}) = ?"));
                params.push(value.to_lowercase());
            }
        }
        if let Some(start) = nonempty(&filter.start_date) {
            sql.push_str(" AND DATE(issues.created_at) >= DATE(?)");
            params.push(start.to_string());
        }
        if let Some(end) = nonempty(&filter.end_date) {
            sql.push_str(" AND DATE(issues.created_at) <= DATE(?)");
            params.push(end.to_string());
        }

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("querying issues")?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let mut issue = issue_from_row(&row)?;
            let has_responses: i64 = row.try_get("has_responses")?;
            issue.status = effective_status(&issue.status, has_responses != 0).to_string();
            let image: Option<Vec<u8>> = row.try_get("image")?;
            views.push(IssueView {
                issue,
                image: image.map(|bytes| BASE64.encode(bytes)),
            });
        }
        Ok(views)
    }

    /// All responses citing `issue_id`, most recent submission first. The
    /// reference is soft: an id the store has never seen still answers with
    /// whatever responses cite it.
    pub async fn list_responses(&self, issue_id: &str) -> Result<Vec<ResponseView>> {
        let rows = sqlx::query(
            r#"
            SELECT "key", submission_date, entity_problem, action_role, action_status,
                   action_action_taken, action_image, action_resolution_costusd,
                   action_resolution_timeframe, action_recommended_contact, submitter_name
              FROM responses
             WHERE entity_problem = ?
             ORDER BY submission_date DESC
            "#,
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("querying responses for issue {issue_id}"))?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let image: Option<Vec<u8>> = row.try_get("action_image")?;
            views.push(ResponseView {
                key: row.try_get("key")?,
                submission_date: row.try_get("submission_date")?,
                entity_problem: row.try_get("entity_problem")?,
                action_role: row.try_get("action_role")?,
                action_status: row.try_get("action_status")?,
                action_action_taken: row.try_get("action_action_taken")?,
                action_image: image.map(|bytes| BASE64.encode(bytes)),
                action_resolution_costusd: row.try_get("action_resolution_costusd")?,
                action_resolution_timeframe: row.try_get("action_resolution_timeframe")?,
                action_recommended_contact: row.try_get("action_recommended_contact")?,
                submitter_name: row.try_get("submitter_name")?,
            });
        }
        Ok(views)
    }
}

const ISSUE_COLUMNS: &str = "issues.id, issues.label, issues.type, issues.description, \
    issues.severity, issues.status, issues.timeframe, issues.action_taken, issues.costusd, \
    issues.savedusd, issues.recommended_contact, issues.latitude, issues.longitude, \
    issues.created_at, issues.updated_at, issues.creator_id, issues.creator_name, issues.version";

fn issue_from_row(row: &SqliteRow) -> Result<Issue> {
    Ok(Issue {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        kind: row.try_get("type")?,
        description: row.try_get("description")?,
        severity: row.try_get("severity")?,
        status: row.try_get("status")?,
        timeframe: row.try_get("timeframe")?,
        action_taken: row.try_get("action_taken")?,
        costusd: row.try_get("costusd")?,
        savedusd: row.try_get("savedusd")?,
        recommended_contact: row.try_get("recommended_contact")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        version: row.try_get("version")?,
    })
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
