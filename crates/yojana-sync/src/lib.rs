//! Scheme sync pipeline: fetch, normalize, reconcile, upsert, schedule.
//!
//! One run pulls raw records from every enabled source, normalizes them,
//! diffs them against the stored snapshot, and applies the resulting plan
//! as chunked idempotent upserts. Repeated runs with unchanged external
//! data converge: no version bumps, no duplicate records, and stored
//! records absent from a fetch are never deleted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;
use yojana_core::{SchemeDraft, SchemeRecord};
use yojana_sources::{
    normalize, source_for_descriptor, FetchCause, FetchError, SchemeSource, SourceDescriptor,
};
use yojana_store::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JsonFileStore, SchemeStore, WriteError,
};

pub const CRATE_NAME: &str = "yojana-sync";

/// Registry of configured providers, parsed from `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub sources_file: PathBuf,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub chunk_size: usize,
    pub write_concurrency: usize,
    pub write_retries: usize,
    pub write_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_dir: std::env::var("YOJANA_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./schemes")),
            sources_file: std::env::var("YOJANA_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            // Daily at midnight; seconds-resolution cron expression.
            sync_cron: std::env::var("YOJANA_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 0 * * *".to_string()),
            user_agent: std::env::var("YOJANA_USER_AGENT")
                .unwrap_or_else(|_| "yojana-sync/0.1".to_string()),
            http_timeout_secs: env_u64("YOJANA_HTTP_TIMEOUT_SECS", 20),
            source_timeout_secs: env_u64("YOJANA_SOURCE_TIMEOUT_SECS", 60),
            chunk_size: env_u64("YOJANA_CHUNK_SIZE", 50) as usize,
            write_concurrency: env_u64("YOJANA_WRITE_CONCURRENCY", 4) as usize,
            write_retries: env_u64("YOJANA_WRITE_RETRIES", 3) as usize,
            write_timeout_secs: env_u64("YOJANA_WRITE_TIMEOUT_SECS", 30),
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    fn write_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.write_retries,
            ..Default::default()
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Run-level failure. Anything softer (one bad source, one bad record,
/// one failed chunk) is degraded to counts in the summary instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("all {sources} configured sources failed to fetch")]
    AllSourcesFailed { sources: usize },
    #[error("no records could be written ({failed} write failures)")]
    NothingWritten { failed: usize },
    #[error("store failure: {0}")]
    Store(#[from] WriteError),
}

/// What one sync run did, for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_total: usize,
    pub sources_failed: usize,
    pub fetched_records: usize,
    pub skipped_records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub touched: usize,
    pub failed_records: usize,
    pub unmatched_stored: usize,
    pub duplicate_candidates: usize,
    /// Inserted + updated. Touch-only refreshes do not count as changed.
    pub changed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Insert,
    Update,
    Touch,
}

/// Output of reconciliation: three disjoint lists of ready-to-write
/// records plus observability counts.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub inserts: Vec<SchemeRecord>,
    pub updates: Vec<SchemeRecord>,
    pub touches: Vec<SchemeRecord>,
    /// Stored records with no candidate this run. Left untouched so a
    /// transient source outage can never masquerade as a deletion.
    pub unmatched_stored: usize,
    pub duplicate_candidates: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.touches.is_empty()
    }
}

/// Diffs this run's candidates against the stored snapshot.
///
/// A candidate absent from the store becomes an insert at version 1; one
/// whose content hash differs becomes an update carrying `version + 1`; an
/// identical one becomes a touch refreshing only `last_seen_at`. Duplicate
/// identity keys within one run keep the first sighting.
pub fn reconcile(
    stored: &[SchemeRecord],
    candidates: Vec<SchemeDraft>,
    now: DateTime<Utc>,
) -> ReconcilePlan {
    let by_key: BTreeMap<&str, &SchemeRecord> = stored
        .iter()
        .map(|r| (r.identity_key.as_str(), r))
        .collect();

    let mut plan = ReconcilePlan::default();
    let mut seen: BTreeMap<String, ()> = BTreeMap::new();

    for candidate in candidates {
        if seen
            .insert(candidate.identity_key.clone(), ())
            .is_some()
        {
            plan.duplicate_candidates += 1;
            continue;
        }

        match by_key.get(candidate.identity_key.as_str()) {
            None => plan.inserts.push(SchemeRecord {
                identity_key: candidate.identity_key,
                payload: candidate.payload,
                content_hash: candidate.content_hash,
                version: 1,
                first_seen_at: now,
                last_seen_at: now,
            }),
            Some(existing) if existing.content_hash != candidate.content_hash => {
                plan.updates.push(SchemeRecord {
                    identity_key: candidate.identity_key,
                    payload: candidate.payload,
                    content_hash: candidate.content_hash,
                    version: existing.version + 1,
                    first_seen_at: existing.first_seen_at,
                    last_seen_at: now,
                })
            }
            Some(existing) => {
                let mut touched = (*existing).clone();
                touched.last_seen_at = now;
                plan.touches.push(touched);
            }
        }
    }

    plan.unmatched_stored = stored
        .iter()
        .filter(|r| !seen.contains_key(&r.identity_key))
        .count();
    plan
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub touched: usize,
    pub failed_records: usize,
}

impl WriteOutcome {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.touched
    }

    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Applies a reconcile plan as bounded, concurrently-issued chunks.
///
/// Chunks never share identity keys (the reconciler's lists are disjoint),
/// so concurrent chunks cannot race on a record. Each attempt runs under a
/// timeout so a wedged store cannot stall the run. A failed or timed-out
/// chunk is retried with backoff up to the configured bound, then counted
/// as failed while already-committed chunks stay committed.
pub struct UpsertWriter {
    store: Arc<dyn SchemeStore>,
    chunk_size: usize,
    concurrency: usize,
    backoff: BackoffPolicy,
    write_timeout: Duration,
}

impl UpsertWriter {
    pub fn new(
        store: Arc<dyn SchemeStore>,
        chunk_size: usize,
        concurrency: usize,
        backoff: BackoffPolicy,
        write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
            backoff,
            write_timeout,
        }
    }

    pub async fn apply(&self, plan: ReconcilePlan) -> WriteOutcome {
        let mut chunks: Vec<(ChangeKind, Vec<SchemeRecord>)> = Vec::new();
        for (kind, records) in [
            (ChangeKind::Insert, plan.inserts),
            (ChangeKind::Update, plan.updates),
            (ChangeKind::Touch, plan.touches),
        ] {
            for chunk in records.chunks(self.chunk_size) {
                chunks.push((kind, chunk.to_vec()));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for (kind, chunk) in chunks {
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let backoff = self.backoff;
            let write_timeout = self.write_timeout;
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                for attempt in 0..=backoff.max_retries {
                    let result = match tokio::time::timeout(
                        write_timeout,
                        store.upsert_batch(&chunk),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(WriteError::Timeout(write_timeout)),
                    };
                    match result {
                        Ok(applied) => return (kind, applied, 0usize),
                        Err(err) if attempt < backoff.max_retries => {
                            warn!(error = %err, attempt, records = chunk.len(),
                                "chunk write failed; retrying");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        }
                        Err(err) => {
                            error!(error = %err, records = chunk.len(),
                                "chunk write failed after retries; giving up on chunk");
                            return (kind, 0, chunk.len());
                        }
                    }
                }
                unreachable!("retry loop always returns")
            });
        }

        let mut outcome = WriteOutcome::default();
        while let Some(joined) = set.join_next().await {
            let (kind, applied, failed) = joined.expect("chunk task not cancelled");
            outcome.failed_records += failed;
            match kind {
                ChangeKind::Insert => outcome.inserted += applied,
                ChangeKind::Update => outcome.updated += applied,
                ChangeKind::Touch => outcome.touched += applied,
            }
        }
        outcome
    }
}

/// One end-to-end sync: fetch → normalize → reconcile → upsert.
pub struct SyncPipeline {
    config: SyncConfig,
    sources: Vec<Arc<dyn SchemeSource>>,
    store: Arc<dyn SchemeStore>,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        sources: Vec<Arc<dyn SchemeSource>>,
        store: Arc<dyn SchemeStore>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            config,
            sources,
            store,
            http,
        }
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let sources: Vec<Arc<dyn SchemeSource>> = registry
            .sources
            .iter()
            .filter(|d| d.enabled)
            .map(|d| Arc::from(source_for_descriptor(d)))
            .collect();
        let store = Arc::new(JsonFileStore::new(config.store_dir.clone()));
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        Ok(Self::new(config, sources, store, http))
    }

    pub fn cron_expression(&self) -> &str {
        &self.config.sync_cron
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = self.sources.len(), "sync run started");

        // Snapshot first: the pipeline holds no state between runs beyond
        // what it reads here.
        let stored = self.store.read_all().await?;

        let (raws, sources_failed) = self.fetch_all(run_id).await;
        if !self.sources.is_empty() && sources_failed == self.sources.len() {
            return Err(PipelineError::AllSourcesFailed {
                sources: sources_failed,
            });
        }
        let fetched_records = raws.len();

        let now = Utc::now();
        let mut candidates = Vec::new();
        let mut skipped_records = 0usize;
        for raw in &raws {
            match normalize(raw, now) {
                Ok(draft) => candidates.push(draft),
                Err(err) => {
                    skipped_records += 1;
                    warn!(%run_id, error = %err, "skipping record that failed normalization");
                }
            }
        }

        let plan = reconcile(&stored, candidates, now);
        if plan.duplicate_candidates > 0 {
            warn!(%run_id, duplicates = plan.duplicate_candidates,
                "dropped duplicate candidates within one run");
        }

        let had_work = !plan.is_empty();
        let unmatched_stored = plan.unmatched_stored;
        let duplicate_candidates = plan.duplicate_candidates;

        let writer = UpsertWriter::new(
            self.store.clone(),
            self.config.chunk_size,
            self.config.write_concurrency,
            self.config.write_backoff(),
            self.config.write_timeout(),
        );
        let outcome = writer.apply(plan).await;

        if had_work && outcome.applied() == 0 {
            return Err(PipelineError::NothingWritten {
                failed: outcome.failed_records,
            });
        }

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            sources_total: self.sources.len(),
            sources_failed,
            fetched_records,
            skipped_records,
            inserted: outcome.inserted,
            updated: outcome.updated,
            touched: outcome.touched,
            failed_records: outcome.failed_records,
            unmatched_stored,
            duplicate_candidates,
            changed: outcome.changed(),
        };
        info!(%run_id,
            inserted = summary.inserted,
            updated = summary.updated,
            touched = summary.touched,
            skipped = summary.skipped_records,
            failed = summary.failed_records,
            unmatched = summary.unmatched_stored,
            changed = summary.changed,
            "sync run complete");
        Ok(summary)
    }

    /// Fetches every source concurrently with a per-source timeout.
    /// Failures are collected and logged, never propagated to siblings.
    async fn fetch_all(&self, run_id: Uuid) -> (Vec<yojana_sources::RawSchemeRecord>, usize) {
        let mut set = JoinSet::new();
        for source in &self.sources {
            let source = source.clone();
            let http = self.http.clone();
            let timeout = self.config.source_timeout();
            set.spawn(async move {
                match tokio::time::timeout(timeout, source.fetch(&http, run_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError {
                        source_id: source.source_id().to_string(),
                        cause: FetchCause::Timeout(timeout),
                    }),
                }
            });
        }

        let mut raws = Vec::new();
        let mut failed = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined.expect("fetch task not cancelled") {
                Ok(records) => raws.extend(records),
                Err(err) => {
                    failed += 1;
                    warn!(%run_id, source_id = %err.source_id, error = %err,
                        "source fetch failed; continuing with remaining sources");
                }
            }
        }
        (raws, failed)
    }
}

/// Scheduler state, observable for operations.
///
/// Between runs the state reports the last run's outcome: `Failed` sticks
/// until the next trigger flips it to `Running`, so an operator polling
/// [`SyncScheduler::state`] can see that the previous run went wrong.
/// Mutual exclusion is enforced by the gate, not by this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Failed,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(RunSummary),
    Failed(PipelineError),
    /// A run was already in flight; this trigger was dropped, not queued.
    Dropped,
}

/// Mutual-exclusion shell around the pipeline.
///
/// The cron job and the manual CLI trigger both land in [`trigger`], so at
/// most one run executes at a time system-wide. A trigger arriving while a
/// run holds the gate is dropped and logged.
///
/// [`trigger`]: SyncScheduler::trigger
pub struct SyncScheduler {
    pipeline: Arc<SyncPipeline>,
    gate: Mutex<()>,
    state: StdMutex<RunState>,
}

impl SyncScheduler {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            gate: Mutex::new(()),
            state: StdMutex::new(RunState::Idle),
        })
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state lock not poisoned")
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().expect("state lock not poisoned") = state;
    }

    pub async fn trigger(&self) -> TriggerOutcome {
        let Ok(_guard) = self.gate.try_lock() else {
            warn!("sync trigger dropped: a run is already in progress");
            return TriggerOutcome::Dropped;
        };

        self.set_state(RunState::Running);
        match self.pipeline.run_once().await {
            Ok(summary) => {
                self.set_state(RunState::Idle);
                TriggerOutcome::Completed(summary)
            }
            Err(err) => {
                // Terminal for this run only; the next tick still fires.
                self.set_state(RunState::Failed);
                error!(error = %err, "sync run failed");
                TriggerOutcome::Failed(err)
            }
        }
    }

    /// Waits for an in-flight run to finish. Shutdown uses this so a chunk
    /// is never interrupted mid-write.
    pub async fn wait_idle(&self) {
        let _guard = self.gate.lock().await;
    }

    /// Builds and starts the cron-driven trigger.
    pub async fn start(self: &Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = self.clone();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let _ = scheduler.trigger().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(%cron, "scheme sync scheduled");
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yojana_core::{
        content_hash, ApplicationProcess, Eligibility, LocalizedList, LocalizedText,
        SchemePayload, SchemeStatus,
    };
    use yojana_store::MemoryStore;

    fn payload(title: &str, benefit: &str) -> SchemePayload {
        SchemePayload {
            title: LocalizedText::english(title),
            description: LocalizedText::english("desc"),
            benefits: LocalizedList::english(vec![benefit.to_string()]),
            eligibility: Eligibility::default(),
            application: ApplicationProcess::default(),
            issuing_authority: "Ministry of Agriculture".to_string(),
            source_url: "https://example.gov.in/".to_string(),
            category: "central".to_string(),
            status: SchemeStatus::Active,
        }
    }

    fn draft(key: &str, title: &str, benefit: &str, now: DateTime<Utc>) -> SchemeDraft {
        let payload = payload(title, benefit);
        let hash = content_hash(&payload);
        SchemeDraft {
            identity_key: key.to_string(),
            payload,
            content_hash: hash,
            fetched_at: now,
        }
    }

    fn record(key: &str, title: &str, benefit: &str, version: u32, seen: DateTime<Utc>) -> SchemeRecord {
        let payload = payload(title, benefit);
        let hash = content_hash(&payload);
        SchemeRecord {
            identity_key: key.to_string(),
            payload,
            content_hash: hash,
            version,
            first_seen_at: seen,
            last_seen_at: seen,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap()
    }

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn reconcile_classifies_insert_update_touch() {
        let stored = vec![
            record("moa:pm-kisan", "PM-KISAN", "Rs. 6000", 3, t0()),
            record("moa:pmfby", "PMFBY", "crop insurance", 1, t0()),
        ];
        let candidates = vec![
            draft("moa:pm-kisan", "PM-KISAN", "Rs. 8000", t1()), // changed
            draft("moa:pmfby", "PMFBY", "crop insurance", t1()), // unchanged
            draft("moa:enam", "eNAM", "better prices", t1()),    // new
        ];

        let plan = reconcile(&stored, candidates, t1());

        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].identity_key, "moa:enam");
        assert_eq!(plan.inserts[0].version, 1);

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].version, 4);
        assert_eq!(plan.updates[0].first_seen_at, t0());
        assert_eq!(plan.updates[0].last_seen_at, t1());

        assert_eq!(plan.touches.len(), 1);
        assert_eq!(plan.touches[0].version, 1);
        assert_eq!(plan.touches[0].last_seen_at, t1());
        assert_eq!(plan.unmatched_stored, 0);
    }

    #[test]
    fn reconcile_leaves_unmatched_stored_unclassified() {
        let stored = vec![
            record("moa:pm-kisan", "PM-KISAN", "Rs. 6000", 2, t0()),
            record("moa:pmksy", "PMKSY", "irrigation", 1, t0()),
        ];
        let candidates = vec![draft("moa:pm-kisan", "PM-KISAN", "Rs. 6000", t1())];

        let plan = reconcile(&stored, candidates, t1());

        assert!(plan.inserts.is_empty());
        assert!(plan.updates.is_empty());
        assert_eq!(plan.touches.len(), 1);
        assert_eq!(plan.unmatched_stored, 1);
    }

    #[test]
    fn reconcile_drops_duplicate_candidates_keeping_first() {
        let candidates = vec![
            draft("moa:enam", "eNAM", "better prices", t1()),
            draft("moa:enam", "eNAM", "different copy", t1()),
        ];

        let plan = reconcile(&[], candidates, t1());

        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.duplicate_candidates, 1);
        assert_eq!(
            plan.inserts[0].payload.benefits.get("en"),
            Some(["better prices".to_string()].as_slice())
        );
    }

    /// Store that fails the first N upsert calls, then behaves.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl SchemeStore for FlakyStore {
        async fn read_all(&self) -> Result<Vec<SchemeRecord>, WriteError> {
            self.inner.read_all().await
        }

        async fn upsert_batch(&self, records: &[SchemeRecord]) -> Result<usize, WriteError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if failing {
                return Err(WriteError::Backend("injected failure".to_string()));
            }
            self.inner.upsert_batch(records).await
        }
    }

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn write_timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn writer_retries_failed_chunks_until_they_commit() {
        let store = Arc::new(FlakyStore::new(2));
        let writer = UpsertWriter::new(store.clone(), 10, 2, fast_backoff(3), write_timeout());

        let plan = reconcile(&[], vec![draft("moa:enam", "eNAM", "b", t1())], t1());
        let outcome = writer.apply(plan).await;

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.failed_records, 0);
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writer_reports_partial_success_when_a_chunk_exhausts_retries() {
        // Chunk size 1 -> two chunks; the first chunk dispatched burns all
        // its attempts, the other commits.
        let store = Arc::new(FlakyStore::new(2));
        let writer = UpsertWriter::new(store.clone(), 1, 1, fast_backoff(1), write_timeout());

        let plan = reconcile(
            &[],
            vec![
                draft("moa:enam", "eNAM", "b", t1()),
                draft("moa:pmfby", "PMFBY", "c", t1()),
            ],
            t1(),
        );
        let outcome = writer.apply(plan).await;

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.failed_records, 1);
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }

    /// Store whose writes never resolve, standing in for a wedged backend.
    struct HangingStore;

    #[async_trait]
    impl SchemeStore for HangingStore {
        async fn read_all(&self) -> Result<Vec<SchemeRecord>, WriteError> {
            Ok(Vec::new())
        }

        async fn upsert_batch(&self, _records: &[SchemeRecord]) -> Result<usize, WriteError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn writer_times_out_hung_chunks_instead_of_stalling() {
        let writer = UpsertWriter::new(
            Arc::new(HangingStore),
            10,
            2,
            fast_backoff(1),
            Duration::from_millis(20),
        );

        let plan = reconcile(&[], vec![draft("moa:enam", "eNAM", "b", t1())], t1());
        let outcome = writer.apply(plan).await;

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.failed_records, 1);
    }

    #[tokio::test]
    async fn writer_chunks_large_plans() {
        let store = Arc::new(MemoryStore::new());
        let writer = UpsertWriter::new(store.clone(), 3, 2, fast_backoff(0), write_timeout());

        let candidates = (0..10)
            .map(|i| draft(&format!("moa:scheme-{i}"), &format!("Scheme {i}"), "b", t1()))
            .collect();
        let outcome = writer.apply(reconcile(&[], candidates, t1())).await;

        assert_eq!(outcome.inserted, 10);
        assert_eq!(store.snapshot().await.len(), 10);
    }
}
