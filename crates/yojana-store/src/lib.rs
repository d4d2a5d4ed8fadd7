//! Scheme persistence + HTTP fetch utilities.
//!
//! The pipeline only ever talks to storage through [`SchemeStore`], so the
//! reconciliation logic is independent of the storage engine and testable
//! against [`MemoryStore`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;
use yojana_core::SchemeRecord;

pub const CRATE_NAME: &str = "yojana-store";

/// Store-level failure. Per-chunk writes surface this and the writer
/// decides whether to retry.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
    #[error("store write timed out after {0:?}")]
    Timeout(Duration),
}

/// Minimal storage contract the pipeline consumes.
#[async_trait]
pub trait SchemeStore: Send + Sync {
    /// Full snapshot of persisted scheme records.
    async fn read_all(&self) -> Result<Vec<SchemeRecord>, WriteError>;

    /// Insert-or-replace each record by identity key. Re-applying the same
    /// batch must leave the store in the same state. Returns the number of
    /// records applied.
    async fn upsert_batch(&self, records: &[SchemeRecord]) -> Result<usize, WriteError>;
}

/// One JSON document per scheme record under a root directory.
///
/// Records are written to a temp file and renamed into place, so a record
/// is either fully present at its old content or fully present at its new
/// content; readers never observe a torn write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filename for a record: slugged key plus a short digest so distinct
    /// keys that slug identically cannot collide on disk.
    fn file_name(identity_key: &str) -> String {
        let slug: String = identity_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(identity_key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}.json", slug.trim_matches('-'), &digest[..8])
    }

    async fn write_record(&self, record: &SchemeRecord) -> Result<(), WriteError> {
        let path = self.root.join(Self::file_name(&record.identity_key));
        let bytes = serde_json::to_vec_pretty(record)?;

        let temp_path = self
            .root
            .join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(WriteError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemeStore for JsonFileStore {
    async fn read_all(&self) -> Result<Vec<SchemeRecord>, WriteError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            let record: SchemeRecord = serde_json::from_slice(&bytes)?;
            records.push(record);
        }
        records.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        Ok(records)
    }

    async fn upsert_batch(&self, records: &[SchemeRecord]) -> Result<usize, WriteError> {
        fs::create_dir_all(&self.root).await?;
        for record in records {
            self.write_record(record).await?;
        }
        Ok(records.len())
    }
}

/// In-memory store used by pipeline tests and ad-hoc dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, SchemeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: Vec<SchemeRecord>) {
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(record.identity_key.clone(), record);
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, SchemeRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl SchemeStore for MemoryStore {
    async fn read_all(&self) -> Result<Vec<SchemeRecord>, WriteError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn upsert_batch(&self, records: &[SchemeRecord]) -> Result<usize, WriteError> {
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(record.identity_key.clone(), record.clone());
        }
        Ok(records.len())
    }
}

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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff with a cap. Shared by HTTP fetches and the upsert
/// writer's chunk retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
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

/// Transport-level fetch failure. Source-level isolation lives a layer up.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

/// Retrying HTTP client with global and per-source concurrency bounds.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, HttpError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
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
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        Err(HttpError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use yojana_core::{
        content_hash, ApplicationProcess, Eligibility, LocalizedList, LocalizedText,
        SchemePayload, SchemeStatus,
    };

    fn mk_record(key: &str, title: &str, version: u32) -> SchemeRecord {
        let payload = SchemePayload {
            title: LocalizedText::english(title),
            description: LocalizedText::english("desc"),
            benefits: LocalizedList::default(),
            eligibility: Eligibility::default(),
            application: ApplicationProcess::default(),
            issuing_authority: "moa".to_string(),
            source_url: "https://example.gov.in/".to_string(),
            category: "central".to_string(),
            status: SchemeStatus::Active,
        };
        let hash = content_hash(&payload);
        let seen = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();
        SchemeRecord {
            identity_key: key.to_string(),
            payload,
            content_hash: hash,
            version,
            first_seen_at: seen,
            last_seen_at: seen,
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let records = vec![mk_record("moa:pm-kisan", "PM-KISAN", 1), mk_record("moa:pmfby", "PMFBY", 2)];
        let written = store.upsert_batch(&records).await.expect("upsert");
        assert_eq!(written, 2);

        let read = store.read_all().await.expect("read_all");
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].identity_key, "moa:pm-kisan");
        assert_eq!(read[1].version, 2);
    }

    #[tokio::test]
    async fn file_store_upsert_replaces_by_key() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        store
            .upsert_batch(&[mk_record("moa:enam", "eNAM", 1)])
            .await
            .expect("first upsert");
        store
            .upsert_batch(&[mk_record("moa:enam", "eNAM v2", 2)])
            .await
            .expect("second upsert");

        let read = store.read_all().await.expect("read_all");
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].version, 2);
        assert_eq!(read[0].payload.title.get("en"), Some("eNAM v2"));
    }

    #[test]
    fn distinct_keys_never_share_a_file_name() {
        assert_ne!(
            JsonFileStore::file_name("moa:pm-kisan"),
            JsonFileStore::file_name("moa-pm:kisan")
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
