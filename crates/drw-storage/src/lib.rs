//! HTTP fetch, project store and batch-file persistence for design-review watch.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use drw_core::{BatchContents, DedupKey, GeoPoint, ProjectBatch, ProjectRecord};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "drw-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for a single GET. Zero retries unless configured.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-2xx response into `FetchError::HttpStatus` for its final URL.
    pub fn ensure_success(self) -> Result<Self, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::HttpStatus {
                status: self.status.as_u16(),
                url: self.final_url,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Read-only access to remote documents (the feed and detail pages).
/// Implementations may return non-2xx responses as `Ok`; callers check
/// them with [`FetchedResponse::ensure_success`].
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Shared client for adapters that speak JSON APIs.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable index value for a dedup tuple.
pub fn dedup_digest(key: &DedupKey) -> String {
    sha256_hex(key.canonical_string().as_bytes())
}

pub type StoreId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProject {
    pub id: StoreId,
    pub record: ProjectRecord,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document (de)serialization failed: {0}")]
    Document(#[from] serde_json::Error),
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
}

/// Document collection holding project records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    fn collection(&self) -> &str;

    async fn insert_one(&self, record: &ProjectRecord) -> Result<StoreId, StoreError>;

    /// Insert all records, replacing the collection first when `drop_existing` is set.
    async fn insert_many(
        &self,
        records: &[ProjectRecord],
        drop_existing: bool,
    ) -> Result<usize, StoreError>;

    async fn find_by_key(&self, key: &DedupKey) -> Result<Vec<StoredProject>, StoreError>;

    async fn find_all(&self) -> Result<Vec<StoredProject>, StoreError>;

    /// Patch latitude/longitude on one document; other fields are untouched.
    async fn update_geo(&self, id: StoreId, point: GeoPoint) -> Result<bool, StoreError>;

    async fn drop_collection(&self) -> Result<(), StoreError>;
}

/// In-process store, used for dry runs and tests.
#[derive(Debug)]
pub struct MemoryProjectStore {
    collection: String,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: StoreId,
    rows: Vec<StoredProject>,
}

impl MemoryState {
    fn push(&mut self, record: ProjectRecord) -> StoreId {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.push(StoredProject { id, record });
        id
    }
}

impl MemoryProjectStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn insert_one(&self, record: &ProjectRecord) -> Result<StoreId, StoreError> {
        Ok(self.state.lock().await.push(record.clone()))
    }

    async fn insert_many(
        &self,
        records: &[ProjectRecord],
        drop_existing: bool,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if drop_existing {
            state.rows.clear();
        }
        for record in records {
            state.push(record.clone());
        }
        Ok(records.len())
    }

    async fn find_by_key(&self, key: &DedupKey) -> Result<Vec<StoredProject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|row| &row.record.dedup_key() == key)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<StoredProject>, StoreError> {
        Ok(self.state.lock().await.rows.clone())
    }

    async fn update_geo(&self, id: StoreId, point: GeoPoint) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.iter_mut().find(|row| row.id == id) else {
            return Ok(false);
        };
        let mut doc = serde_json::to_value(&row.record)?;
        patch_geo_fields(&mut doc, point);
        row.record = serde_json::from_value(doc)?;
        Ok(true)
    }

    async fn drop_collection(&self) -> Result<(), StoreError> {
        self.state.lock().await.rows.clear();
        Ok(())
    }
}

fn patch_geo_fields(doc: &mut serde_json::Value, point: GeoPoint) {
    if let Some(map) = doc.as_object_mut() {
        map.insert("latitude".to_string(), serde_json::json!(point.latitude));
        map.insert("longitude".to_string(), serde_json::json!(point.longitude));
    }
}

/// Collection names are spliced into SQL, so keep them to plain identifiers.
pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if valid_start
        && name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

/// Postgres-backed collection: one JSONB document per row.
#[derive(Debug, Clone)]
pub struct PgProjectStore {
    pool: PgPool,
    collection: String,
}

impl PgProjectStore {
    pub async fn connect(database_url: &str, collection: &str) -> Result<Self, StoreError> {
        validate_collection_name(collection)?;
        let pool = PgPool::connect(database_url).await?;
        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {c} (
                id          BIGSERIAL PRIMARY KEY,
                dedup_key   TEXT NOT NULL,
                doc         JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            c = self.collection
        )
    }

    fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{c}_dedup_key ON {c}(dedup_key)",
            c = self.collection
        )
    }

    async fn ensure_collection(&self) -> Result<(), StoreError> {
        sqlx::query(&self.create_table_sql())
            .execute(&self.pool)
            .await?;
        sqlx::query(&self.create_index_sql())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn rows_to_projects(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StoredProject>, StoreError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let doc: serde_json::Value = row.try_get("doc")?;
            out.push(StoredProject {
                id,
                record: serde_json::from_value(doc)?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn insert_one(&self, record: &ProjectRecord) -> Result<StoreId, StoreError> {
        self.ensure_collection().await?;
        let sql = format!(
            "INSERT INTO {} (dedup_key, doc) VALUES ($1, $2) RETURNING id",
            self.collection
        );
        let row = sqlx::query(&sql)
            .bind(dedup_digest(&record.dedup_key()))
            .bind(serde_json::to_value(record)?)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    async fn insert_many(
        &self,
        records: &[ProjectRecord],
        drop_existing: bool,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        if drop_existing {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.collection))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&self.create_table_sql()).execute(&mut *tx).await?;
        sqlx::query(&self.create_index_sql()).execute(&mut *tx).await?;

        let sql = format!(
            "INSERT INTO {} (dedup_key, doc) VALUES ($1, $2)",
            self.collection
        );
        for record in records {
            sqlx::query(&sql)
                .bind(dedup_digest(&record.dedup_key()))
                .bind(serde_json::to_value(record)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn find_by_key(&self, key: &DedupKey) -> Result<Vec<StoredProject>, StoreError> {
        self.ensure_collection().await?;
        let sql = format!(
            "SELECT id, doc FROM {} WHERE dedup_key = $1 ORDER BY id",
            self.collection
        );
        let rows = sqlx::query(&sql)
            .bind(dedup_digest(key))
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::rows_to_projects(rows)?
            .into_iter()
            .filter(|p| &p.record.dedup_key() == key)
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<StoredProject>, StoreError> {
        self.ensure_collection().await?;
        let sql = format!("SELECT id, doc FROM {} ORDER BY id", self.collection);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Self::rows_to_projects(rows)
    }

    async fn update_geo(&self, id: StoreId, point: GeoPoint) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
               SET doc = doc || jsonb_build_object('latitude', $2::float8, 'longitude', $3::float8)
             WHERE id = $1
            "#,
            self.collection
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(point.latitude)
            .bind(point.longitude)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn drop_collection(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.collection))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Read a batch file; a bare JSON array of records is accepted too.
pub async fn read_batch_file(path: impl AsRef<Path>) -> anyhow::Result<BatchContents> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Write a batch file via a temp file and rename.
pub async fn write_batch_file(path: impl AsRef<Path>, batch: &ProjectBatch) -> anyhow::Result<()> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec_pretty(batch).context("serializing project batch")?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.json.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes)
        .await
        .with_context(|| format!("writing temp batch file {}", temp_path.display()))?;

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp batch file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
