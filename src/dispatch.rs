//! # Dispatch, Job Queues and Workers
//!
//! Turns reconciliation work into idempotent units ([`ReconcileJob`]) that
//! run synchronously or go through a [`JobQueue`]. Queues deliver at least
//! once; a job that is retried after a partial run converges to the same
//! assignment set because every write is insert-if-absent or a scoped
//! replace.
//!
//! Full-table scans ([`reconcile_scope`]) walk the feature table in
//! primary-key-ordered chunks and never hold more than one chunk in memory.

use std::collections::BTreeMap;
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::{check_chunk_size, ReconcileConfig};
use crate::engine::{ChunkMode, ChunkReport, ReconciliationEngine};
use crate::error::{OptionExt, ReconcileError, Result};
use crate::store::FeatureFilter;
use crate::{ContainerLevel, FeatureKind};

// ============================================================================
// Jobs
// ============================================================================

/// One unit of reconciliation work: a set of features against one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileJob {
    pub kind: FeatureKind,
    pub level: ContainerLevel,
    pub feature_ids: Vec<i64>,
    /// Containers of `level` in scope; empty means all
    #[serde(default)]
    pub container_ids: Vec<i64>,
    #[serde(default)]
    pub mode: ChunkMode,
}

impl ReconcileJob {
    /// Additive job for a single feature.
    pub fn feature(kind: FeatureKind, id: i64, level: ContainerLevel) -> Self {
        Self {
            kind,
            level,
            feature_ids: vec![id],
            container_ids: Vec::new(),
            mode: ChunkMode::Additive,
        }
    }

    /// MessagePack payload stored in the queue.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

/// Run a job against the engine.
///
/// Ids that no longer exist are counted as skipped; in replace mode their
/// stale rows are removed.
pub fn execute_job(engine: &mut ReconciliationEngine, job: &ReconcileJob) -> Result<ChunkReport> {
    let features = engine.store().features_by_ids(job.kind, &job.feature_ids)?;
    let mut report = engine.reconcile_chunk(job.level, &features, job.mode, &job.container_ids)?;

    for &id in &job.feature_ids {
        if features.binary_search_by_key(&id, |f| f.id).is_ok() {
            continue;
        }
        log::debug!("[Dispatch] {} {} no longer exists", job.kind, id);
        report.skipped += 1;
        if job.mode == ChunkMode::Replace {
            engine
                .store()
                .delete_assignments(job.kind, job.level, id, &job.container_ids)?;
        }
    }
    Ok(report)
}

// ============================================================================
// Job Queues
// ============================================================================

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: i64,
    pub queue: String,
    /// Attempts so far, including the current one
    pub attempts: u32,
    pub job: ReconcileJob,
}

/// Job counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// At-least-once job queue.
pub trait JobQueue {
    /// Enqueue a job; returns its id.
    fn push(&self, queue: &str, job: &ReconcileJob) -> Result<i64>;

    /// Atomically take the oldest pending job of `queue`.
    fn claim(&self, queue: &str) -> Result<Option<QueuedJob>>;

    fn complete(&self, job_id: i64) -> Result<()>;

    /// Record a failure; `retry` puts the job back to pending.
    fn fail(&self, job_id: i64, error: &str, retry: bool) -> Result<()>;

    fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Release jobs left running for longer than `lease_secs`, whose worker
    /// is presumed dead. Jobs with attempts left go back to pending, the
    /// rest are marked failed. Returns the number of jobs released.
    fn requeue_stale(&self, queue: &str, lease_secs: u64, max_attempts: u32) -> Result<usize>;

    fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self.counts(queue)?.pending)
    }
}

struct MemoryJob {
    queue: String,
    payload: Vec<u8>,
    status: JobStatus,
    attempts: u32,
    last_error: Option<String>,
    claimed_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<i64, MemoryJob>,
}

/// In-process queue. Payloads are encoded like the durable queue so both
/// behave the same.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ReconcileError::Queue("memory queue lock poisoned".into()))
    }

    /// Last error recorded for a job.
    pub fn last_error(&self, job_id: i64) -> Result<Option<String>> {
        Ok(self.lock()?.jobs.get(&job_id).and_then(|j| j.last_error.clone()))
    }
}

impl JobQueue for MemoryQueue {
    fn push(&self, queue: &str, job: &ReconcileJob) -> Result<i64> {
        let payload = job.encode()?;
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            MemoryJob {
                queue: queue.to_string(),
                payload,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                claimed_at: None,
            },
        );
        Ok(id)
    }

    fn claim(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let mut state = self.lock()?;
        let Some((&id, entry)) = state
            .jobs
            .iter_mut()
            .find(|(_, j)| j.queue == queue && j.status == JobStatus::Pending)
        else {
            return Ok(None);
        };
        entry.status = JobStatus::Running;
        entry.attempts += 1;
        entry.claimed_at = Some(Instant::now());
        let job = ReconcileJob::decode(&entry.payload)?;
        Ok(Some(QueuedJob {
            id,
            queue: entry.queue.clone(),
            attempts: entry.attempts,
            job,
        }))
    }

    fn complete(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&job_id).ok_or_not_found("job", job_id)?;
        job.status = JobStatus::Done;
        Ok(())
    }

    fn fail(&self, job_id: i64, error: &str, retry: bool) -> Result<()> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&job_id).ok_or_not_found("job", job_id)?;
        job.status = if retry { JobStatus::Pending } else { JobStatus::Failed };
        job.last_error = Some(error.to_string());
        Ok(())
    }

    fn counts(&self, queue: &str) -> Result<JobCounts> {
        let state = self.lock()?;
        let mut counts = JobCounts::default();
        for job in state.jobs.values().filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn requeue_stale(&self, queue: &str, lease_secs: u64, max_attempts: u32) -> Result<usize> {
        let lease = Duration::from_secs(lease_secs);
        let mut state = self.lock()?;
        let mut released = 0;
        for job in state.jobs.values_mut() {
            let expired = job.claimed_at.is_some_and(|at| at.elapsed() >= lease);
            if job.queue == queue && job.status == JobStatus::Running && expired {
                job.status = if job.attempts < max_attempts {
                    JobStatus::Pending
                } else {
                    JobStatus::Failed
                };
                job.last_error = Some(STALE_ERROR.to_string());
                job.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

const STALE_ERROR: &str = "worker lost: lease expired";

/// Durable queue in the `reconcile_jobs` table.
///
/// Claims are a single `UPDATE ... RETURNING`, so two workers never take
/// the same job. A claim stamps `updated_at`; jobs running past the lease
/// are released by [`JobQueue::requeue_stale`].
pub struct SqliteJobQueue {
    conn: Connection,
}

impl SqliteJobQueue {
    pub fn open(path: &str, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:", 0)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reconcile_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_reconcile_jobs_claim ON reconcile_jobs(queue, status, id);
            "#,
        )?;
        Ok(())
    }

    /// Failed jobs of a queue with their last error.
    pub fn failed_jobs(&self, queue: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, COALESCE(last_error, '') FROM reconcile_jobs
             WHERE queue = ? AND status = 'failed' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([queue], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn set_status(&self, job_id: i64, status: JobStatus, error: Option<&str>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE reconcile_jobs
             SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = strftime('%s', 'now')
             WHERE id = ?3",
            params![status.as_str(), error, job_id],
        )?;
        if updated == 0 {
            return Err(ReconcileError::NotFound {
                entity: "job".to_string(),
                id: job_id,
            });
        }
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    fn push(&self, queue: &str, job: &ReconcileJob) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO reconcile_jobs (queue, payload) VALUES (?, ?)",
            params![queue, job.encode()?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn claim(&self, queue: &str) -> Result<Option<QueuedJob>> {
        loop {
            let claimed: Option<(i64, Vec<u8>, u32)> = self
                .conn
                .query_row(
                    "UPDATE reconcile_jobs
                     SET status = 'running', attempts = attempts + 1, updated_at = strftime('%s', 'now')
                     WHERE id = (SELECT id FROM reconcile_jobs
                                 WHERE queue = ?1 AND status = 'pending' ORDER BY id LIMIT 1)
                     RETURNING id, payload, attempts",
                    [queue],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((id, payload, attempts)) = claimed else {
                return Ok(None);
            };
            match ReconcileJob::decode(&payload) {
                Ok(job) => {
                    return Ok(Some(QueuedJob {
                        id,
                        queue: queue.to_string(),
                        attempts,
                        job,
                    }))
                }
                Err(e) => {
                    // Undecodable payloads can never succeed
                    log::error!("[Dispatch] Job {} has a corrupt payload: {}", id, e);
                    self.set_status(id, JobStatus::Failed, Some(&e.to_string()))?;
                }
            }
        }
    }

    fn complete(&self, job_id: i64) -> Result<()> {
        self.set_status(job_id, JobStatus::Done, None)
    }

    fn fail(&self, job_id: i64, error: &str, retry: bool) -> Result<()> {
        let status = if retry { JobStatus::Pending } else { JobStatus::Failed };
        self.set_status(job_id, status, Some(error))
    }

    fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM reconcile_jobs WHERE queue = ? GROUP BY status")?;
        let rows = stmt
            .query_map([queue], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = n as usize;
            match status.as_str() {
                "pending" => counts.pending = n,
                "running" => counts.running = n,
                "done" => counts.done = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    fn requeue_stale(&self, queue: &str, lease_secs: u64, max_attempts: u32) -> Result<usize> {
        let lease = i64::try_from(lease_secs).unwrap_or(i64::MAX);
        let released = self.conn.execute(
            "UPDATE reconcile_jobs
             SET status = CASE WHEN attempts < ?3 THEN 'pending' ELSE 'failed' END,
                 last_error = ?4,
                 updated_at = strftime('%s', 'now')
             WHERE queue = ?1 AND status = 'running'
               AND updated_at <= CAST(strftime('%s', 'now') AS INTEGER) - ?2",
            params![queue, lease, max_attempts, STALE_ERROR],
        )?;
        if released > 0 {
            log::warn!("[Dispatch] Released {} stale jobs on '{}'", released, queue);
        }
        Ok(released)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Options for [`dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Run in-process and surface errors instead of enqueueing.
    /// Default: false
    pub sync: bool,

    /// Queue receiving asynchronous jobs.
    /// Default: "geometric-computations"
    pub queue_name: String,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            sync: false,
            queue_name: ReconcileConfig::default().default_queue,
        }
    }
}

/// What [`dispatch`] did with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(ChunkReport),
    Queued { job_id: i64, queue: String },
}

/// Run a job now (`sync`) or enqueue it.
///
/// Synchronous single-feature jobs surface `NotFound` and
/// `InvalidGeometry` to the caller; per-feature store failures of larger
/// jobs are listed in the report.
pub fn dispatch(
    engine: &mut ReconciliationEngine,
    queue: Option<&dyn JobQueue>,
    job: &ReconcileJob,
    options: &DispatchOptions,
) -> Result<DispatchOutcome> {
    if job.feature_ids.is_empty() {
        return Err(ReconcileError::Config("job targets no features".into()));
    }

    if options.sync {
        if let [id] = job.feature_ids[..] {
            let feature = engine
                .store()
                .get_feature(job.kind, id)?
                .ok_or_not_found(job.kind.as_str(), id)?;
            feature.geometry()?;
        }
        return Ok(DispatchOutcome::Completed(execute_job(engine, job)?));
    }

    let queue = queue.ok_or_else(|| {
        ReconcileError::Config("asynchronous dispatch needs a job queue".into())
    })?;
    if options.queue_name.trim().is_empty() {
        return Err(ReconcileError::Config("queue name must not be empty".into()));
    }
    let job_id = queue.push(&options.queue_name, job)?;
    log::debug!(
        "[Dispatch] Queued job {} on '{}' ({} {} against {})",
        job_id,
        options.queue_name,
        job.feature_ids.len(),
        job.kind,
        job.level
    );
    Ok(DispatchOutcome::Queued {
        job_id,
        queue: options.queue_name.clone(),
    })
}

// ============================================================================
// Scope Reconciliation
// ============================================================================

/// Options for [`reconcile_scope`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeOptions {
    /// Containers of the level in scope (`--id`); empty means all
    pub container_ids: Vec<i64>,
    /// Features in scope (`--feature-id`); empty means a full scan
    pub feature_ids: Vec<i64>,
    /// Run in-process instead of enqueueing one job per chunk
    pub sync: bool,
    /// Overrides the configured chunk size
    pub chunk_size: Option<usize>,
    /// Count and preview only
    pub dry_run: bool,
    /// Additive, or replace ("fix missing")
    pub mode: ChunkMode,
    /// Only features with no assignment at the level
    pub only_missing: bool,
    /// Also scan features with the stable status
    pub include_validated: bool,
    /// Overrides the configured default queue
    pub queue_name: Option<String>,
}

/// Outcome of [`reconcile_scope`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeReport {
    pub kind: FeatureKind,
    pub level: ContainerLevel,
    pub mode: ChunkMode,
    pub dry_run: bool,
    /// Geolocated features in scope
    pub total: usize,
    pub chunks: usize,
    pub processed: usize,
    pub updated: usize,
    pub unresolved: usize,
    /// Features in scope without geometry, plus invalid ones
    pub skipped: usize,
    pub failed: Vec<i64>,
    pub invalid: Vec<i64>,
    /// Jobs enqueued
    pub dispatched: usize,
    /// Stale rows removed before a replace run
    pub purged: usize,
    /// First ids in scope (dry run only)
    pub preview: Vec<i64>,
    pub missing_before: usize,
    pub missing_after: usize,
}

impl ScopeReport {
    fn new(kind: FeatureKind, level: ContainerLevel, options: &ScopeOptions) -> Self {
        Self {
            kind,
            level,
            mode: options.mode,
            dry_run: options.dry_run,
            total: 0,
            chunks: 0,
            processed: 0,
            updated: 0,
            unresolved: 0,
            skipped: 0,
            failed: Vec::new(),
            invalid: Vec::new(),
            dispatched: 0,
            purged: 0,
            preview: Vec::new(),
            missing_before: 0,
            missing_after: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    fn absorb(&mut self, chunk: ChunkReport) {
        self.processed += chunk.processed;
        self.updated += chunk.updated;
        self.unresolved += chunk.unresolved;
        self.skipped += chunk.skipped;
        self.failed.extend(chunk.failed);
        self.invalid.extend(chunk.invalid);
    }
}

/// Reconcile every in-scope feature of `kind` against `level`.
///
/// Configuration problems (zero chunk size, asynchronous run without a
/// queue, unknown container ids) are reported before any work starts.
pub fn reconcile_scope(
    engine: &mut ReconciliationEngine,
    queue: Option<&dyn JobQueue>,
    kind: FeatureKind,
    level: ContainerLevel,
    options: &ScopeOptions,
) -> Result<ScopeReport> {
    let config = engine.config().clone();
    let chunk_size = options.chunk_size.unwrap_or(config.chunk_size);
    check_chunk_size(chunk_size)?;
    let queue_name = options
        .queue_name
        .clone()
        .unwrap_or_else(|| config.default_queue.clone());
    let queue = match (options.dry_run || options.sync, queue) {
        (true, q) => q,
        (false, Some(q)) => Some(q),
        (false, None) => {
            return Err(ReconcileError::Config(
                "asynchronous run needs a job queue".into(),
            ))
        }
    };
    let unknown = engine
        .store()
        .unknown_container_ids(level, &options.container_ids)?;
    if !unknown.is_empty() {
        return Err(ReconcileError::Config(format!(
            "unknown {} ids: {:?}",
            level, unknown
        )));
    }

    let filter = FeatureFilter {
        feature_ids: options.feature_ids.clone(),
        stable_status: if options.include_validated {
            None
        } else {
            config.stable_status
        },
        missing_level: options.only_missing.then_some(level),
        require_geometry: true,
    };

    let mut report = ScopeReport::new(kind, level, options);
    report.missing_before = engine.missing_count(kind, level)?;
    report.total = engine.store().count_features(kind, &filter)?;
    report.chunks = report.total.div_ceil(chunk_size);
    report.skipped = engine.store().count_ungeolocated(kind, &filter)?;

    log::info!(
        "[Dispatch] {} {} against {}: {} in scope, {} chunks of {}, {} missing",
        if options.dry_run { "Dry run" } else { "Reconciling" },
        kind,
        level,
        report.total,
        report.chunks,
        chunk_size,
        report.missing_before
    );

    if options.dry_run {
        report.preview =
            engine
                .store()
                .feature_id_chunk(kind, None, config.preview_limit, &filter)?;
        report.missing_after = report.missing_before;
        return Ok(report);
    }

    if options.mode == ChunkMode::Replace {
        report.purged = engine.store().purge_ungeolocated(
            kind,
            level,
            &options.container_ids,
            &options.feature_ids,
        )?;
    }

    let mut after = None;
    loop {
        if options.sync {
            let features = engine.store().feature_chunk(kind, after, chunk_size, &filter)?;
            let Some(last) = features.last() else { break };
            after = Some(last.id);
            let chunk = engine.reconcile_chunk(level, &features, options.mode, &options.container_ids)?;
            log::debug!(
                "[Dispatch] Chunk up to {}: {} processed, {} failed",
                last.id,
                chunk.processed,
                chunk.failed.len()
            );
            report.absorb(chunk);
        } else if let Some(queue) = queue {
            let ids = engine.store().feature_id_chunk(kind, after, chunk_size, &filter)?;
            let Some(&last) = ids.last() else { break };
            after = Some(last);
            queue.push(
                &queue_name,
                &ReconcileJob {
                    kind,
                    level,
                    feature_ids: ids,
                    container_ids: options.container_ids.clone(),
                    mode: options.mode,
                },
            )?;
            report.dispatched += 1;
        }
    }

    report.missing_after = engine.missing_count(kind, level)?;
    log::info!(
        "[Dispatch] {} against {}: {} processed, {} updated, {} skipped, {} failed, {} jobs, missing {} -> {}",
        kind,
        level,
        report.processed,
        report.updated,
        report.skipped,
        report.failed.len(),
        report.dispatched,
        report.missing_before,
        report.missing_after
    );
    Ok(report)
}

// ============================================================================
// Workers
// ============================================================================

/// Totals for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerReport {
    pub jobs_completed: usize,
    pub jobs_retried: usize,
    /// Jobs abandoned (permanent error or attempts exhausted)
    pub jobs_failed: Vec<i64>,
    /// Feature counts of completed and abandoned jobs
    pub features: ChunkReport,
}

impl WorkerReport {
    pub fn merge(&mut self, other: WorkerReport) {
        self.jobs_completed += other.jobs_completed;
        self.jobs_retried += other.jobs_retried;
        self.jobs_failed.extend(other.jobs_failed);
        self.features.merge(other.features);
    }
}

/// Drains a queue, retrying transient failures.
#[derive(Debug, Clone)]
pub struct Worker {
    queue_name: String,
    max_attempts: u32,
    lease_secs: u64,
    max_jobs: Option<usize>,
}

impl Worker {
    pub fn new(queue_name: &str, config: &ReconcileConfig) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            max_attempts: config.max_attempts,
            lease_secs: config.job_lease_secs,
            max_jobs: None,
        }
    }

    /// Stop after this many claims.
    pub fn with_max_jobs(mut self, max_jobs: Option<usize>) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Run jobs until the queue is empty (or `max_jobs` is reached).
    ///
    /// Jobs abandoned by dead workers are released first. Returns an error
    /// only when the queue itself fails.
    pub fn run_pending(
        &self,
        engine: &mut ReconciliationEngine,
        queue: &dyn JobQueue,
    ) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        let mut claimed = 0;
        queue.requeue_stale(&self.queue_name, self.lease_secs, self.max_attempts)?;

        while self.max_jobs.map_or(true, |max| claimed < max) {
            let Some(queued) = queue.claim(&self.queue_name)? else {
                break;
            };
            claimed += 1;
            let can_retry = queued.attempts < self.max_attempts;

            match execute_job(engine, &queued.job) {
                Ok(chunk) if chunk.failed.is_empty() => {
                    queue.complete(queued.id)?;
                    report.jobs_completed += 1;
                    report.features.merge(chunk);
                }
                Ok(chunk) => {
                    let error = chunk
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "store error".to_string());
                    queue.fail(queued.id, &error, can_retry)?;
                    if can_retry {
                        log::warn!(
                            "[Worker] Job {} attempt {} had {} failed features; retrying",
                            queued.id,
                            queued.attempts,
                            chunk.failed.len()
                        );
                        report.jobs_retried += 1;
                    } else {
                        log::error!("[Worker] Job {} abandoned after {} attempts: {}", queued.id, queued.attempts, error);
                        report.jobs_failed.push(queued.id);
                        report.features.merge(chunk);
                    }
                }
                Err(e) => {
                    let retry = e.is_transient() && can_retry;
                    queue.fail(queued.id, &e.to_string(), retry)?;
                    if retry {
                        log::warn!("[Worker] Job {} attempt {} failed: {}; retrying", queued.id, queued.attempts, e);
                        report.jobs_retried += 1;
                    } else {
                        log::error!("[Worker] Job {} failed: {}", queued.id, e);
                        report.jobs_failed.push(queued.id);
                    }
                }
            }
        }

        log::info!(
            "[Worker] '{}': {} completed, {} retried, {} failed",
            self.queue_name,
            report.jobs_completed,
            report.jobs_retried,
            report.jobs_failed.len()
        );
        Ok(report)
    }
}

/// Handle for a pool of background workers.
pub struct WorkerPoolHandle {
    receiver: mpsc::Receiver<Result<WorkerReport>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Check if a worker has finished (non-blocking).
    pub fn try_recv(&self) -> Option<Result<WorkerReport>> {
        self.receiver.try_recv().ok()
    }

    /// Wait for every worker and merge their reports (blocking).
    ///
    /// A worker that panicked is reported as a `Queue` error; its claimed
    /// job is picked up again once its lease expires.
    pub fn join(self) -> Result<WorkerReport> {
        let WorkerPoolHandle { receiver, threads } = self;
        let mut merged = WorkerReport::default();
        let mut first_error = None;

        for (n, handle) in threads.into_iter().enumerate() {
            if let Err(panic) = handle.join() {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("[Worker] #{} panicked: {}", n, message);
                first_error.get_or_insert(ReconcileError::Queue(format!(
                    "worker #{} panicked: {}",
                    n, message
                )));
            }
        }

        // Every sender is gone now; drain what the workers sent
        for result in receiver.try_iter() {
            match result {
                Ok(report) => merged.merge(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }
}

/// Run `run(n)` on `workers` threads, sending each result back.
fn spawn_pool<F>(workers: usize, run: F) -> WorkerPoolHandle
where
    F: Fn(usize) -> Result<WorkerReport> + Send + Clone + 'static,
{
    let (tx, rx) = mpsc::channel();
    let threads = (0..workers.max(1))
        .map(|n| {
            let tx = tx.clone();
            let run = run.clone();
            thread::spawn(move || {
                tx.send(run(n)).ok();
            })
        })
        .collect();

    WorkerPoolHandle {
        receiver: rx,
        threads,
    }
}

/// Start `workers` threads draining `queue_name`, each with its own
/// connection to the database at `db_path`.
pub fn spawn_workers(
    db_path: &str,
    config: &ReconcileConfig,
    queue_name: &str,
    workers: usize,
    max_jobs: Option<usize>,
) -> WorkerPoolHandle {
    let db_path = db_path.to_string();
    let config = config.clone();
    let worker = Worker::new(queue_name, &config).with_max_jobs(max_jobs);

    spawn_pool(workers, move |n| {
        log::debug!("[Worker] #{} starting on {}", n, db_path);
        let mut engine = ReconciliationEngine::open(&db_path, config.clone())?;
        let queue = SqliteJobQueue::open(&db_path, config.busy_timeout_ms)?;
        worker.run_pending(&mut engine, &queue)
    })
}

// ============================================================================
// Tests
// ============================================================================
