//! Replication jobs.
//!
//! A job moves through `Locking -> Scanning -> Diffing -> Transferring -> Finalizing`. Only a
//! failure to lock, to list the source root or to persist the final state fails the job as a
//! whole; individual files that keep failing after their retries are reported in the
//! [`JobReport`] and the job carries on with the rest.

use futures::StreamExt;
use tracing::instrument;

use crate::adaptive::{AdaptiveController, TransferOutcome, WorkerPool};
use crate::ensure::DirectoryEnsurer;
use crate::error::{Op, TransportError};
use crate::lock::{Busy, JobLocks};
use crate::path;
use crate::progress::Progress;
use crate::retry::{retry, RetryPolicy};
use crate::scan::{self, FileCandidate, Plan, ScanStatus};
use crate::spool::{self, SpoolSettings};
use crate::state::{now_millis, StateStore, SyncState};
use crate::transport::{Transport, TransportSelection};

pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
pub const DEFAULT_INITIAL_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_CONCURRENCY: usize = 6;
pub const DEFAULT_FLUSH_EVERY: usize = 50;
pub const DEFAULT_FAILURE_PREVIEW: usize = 5;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Transfer everything, ignore and replace the previous state
    Full,
    /// Skip files that are unchanged since the last run or already present on the target
    #[default]
    Incremental,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Retries per file after the first attempt.
    pub retries: usize,
    /// Attempt `n` waits `retry_base_delay * 2^n` before running.
    pub retry_base_delay: std::time::Duration,
    pub initial_concurrency: usize,
    pub max_concurrency: usize,
    /// Per-stream bandwidth cap. Setting it pins the pool to `initial_concurrency`.
    pub rate_limit: Option<throttle::rate::ByteRate>,
    pub spool: SpoolSettings,
    pub scan: scan::Settings,
    /// Persist state after this many successful transfers, 0 only saves at the end.
    pub flush_every: usize,
    /// How many failures the report lists individually.
    pub failure_preview: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            initial_concurrency: DEFAULT_INITIAL_CONCURRENCY,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            rate_limit: None,
            spool: SpoolSettings::default(),
            scan: scan::Settings::default(),
            flush_every: DEFAULT_FLUSH_EVERY,
            failure_preview: DEFAULT_FAILURE_PREVIEW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Identifies the job for locking and state persistence.
    pub key: String,
    pub mode: SyncMode,
    pub plan: Plan,
    pub transports: TransportSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub ok: u64,
    pub skipped: u64,
    pub fail: u64,
    /// The first few failures only.
    pub failures: Vec<FailureDetail>,
}

impl JobReport {
    fn add_failure(&mut self, path: &str, reason: String, preview: usize) {
        self.fail += 1;
        if self.failures.len() < preview {
            self.failures.push(FailureDetail {
                path: path.to_string(),
                reason,
            });
        }
    }
}

impl std::fmt::Display for JobReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files transferred: {}\n\
            files skipped: {}\n\
            files failed: {}",
            self.ok, self.skipped, self.fail,
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.path, failure.reason)?;
        }
        let hidden = self.fail.saturating_sub(self.failures.len() as u64);
        if hidden > 0 {
            write!(f, "\n  ... and {hidden} more")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    Scanning(ScanStatus),
    Transferring { completed: u64, total: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Busy(#[from] Busy),
    #[error("failed scanning source")]
    Scan(#[from] TransportError),
    #[error("failed saving sync state")]
    State(#[source] anyhow::Error),
}

impl Error {
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

struct TargetSlot {
    transport: std::sync::Arc<dyn Transport>,
    ensurer: DirectoryEnsurer,
}

impl TargetSlot {
    fn new(transport: std::sync::Arc<dyn Transport>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            ensurer: DirectoryEnsurer::new(transport.clone()),
            transport,
        })
    }
}

/// The job's current target, switching once to the alternate protocol when the primary one
/// fails in a way that suggests it is unusable.
struct TargetSelector {
    primary: std::sync::Arc<TargetSlot>,
    alternate: Option<std::sync::Arc<TargetSlot>>,
    degraded: std::sync::atomic::AtomicBool,
}

impl TargetSelector {
    fn new(selection: &TransportSelection) -> Self {
        Self {
            primary: TargetSlot::new(selection.target.clone()),
            alternate: selection.fallback_target.clone().map(TargetSlot::new),
            degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn current(&self) -> std::sync::Arc<TargetSlot> {
        match &self.alternate {
            Some(alternate) if self.degraded.load(std::sync::atomic::Ordering::Acquire) => {
                alternate.clone()
            }
            _ => self.primary.clone(),
        }
    }

    /// Items picked up after this call use the alternate target; in-flight ones are unaffected.
    fn degrade_on(&self, error: &TransportError) {
        let Some(alternate) = &self.alternate else {
            return;
        };
        if error.protocol != self.primary.transport.protocol() || !error.suggests_fallback() {
            return;
        }
        if !self.degraded.swap(true, std::sync::atomic::Ordering::AcqRel) {
            tracing::warn!(
                "target {} looks unusable ({}), switching to {} for the remaining files",
                self.primary.transport.protocol(),
                error,
                alternate.transport.protocol()
            );
        }
    }
}

struct Completed {
    candidate: FileCandidate,
    result: Result<(), TransportError>,
}

/// Everything a single file transfer needs, shared by all workers of one job.
struct Transfer {
    source: std::sync::Arc<dyn Transport>,
    targets: TargetSelector,
    limiter: std::sync::Arc<throttle::TransferLimiter>,
    policy: RetryPolicy,
    rate: Option<throttle::rate::ByteRate>,
    spool: SpoolSettings,
    prog_track: &'static Progress,
}

impl Transfer {
    async fn run(self: std::sync::Arc<Self>, candidate: FileCandidate) -> (TransferOutcome, Completed) {
        let _guard = self.prog_track.transfers.guard();
        let start = std::time::Instant::now();
        let stale_handle = std::sync::atomic::AtomicBool::new(false);
        let result = retry(
            &self.policy,
            |error: &TransportError| error.is_retryable() || error.is_expired_handle(),
            |_| {
                let this = &self;
                let candidate = &candidate;
                let stale_handle = &stale_handle;
                async move {
                    let refresh = stale_handle.swap(false, std::sync::atomic::Ordering::Relaxed);
                    let result = this.attempt(candidate, refresh).await;
                    if let Err(error) = &result {
                        if error.is_expired_handle() {
                            stale_handle.store(true, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                    result
                }
            },
        )
        .await;
        let elapsed = start.elapsed();
        let outcome = match &result {
            Ok(()) => TransferOutcome::success(elapsed),
            Err(error) => TransferOutcome::failure(elapsed, error.to_string(), error.is_timeout()),
        };
        (outcome, Completed { candidate, result })
    }

    async fn attempt(&self, candidate: &FileCandidate, refresh: bool) -> Result<(), TransportError> {
        let target = self.targets.current();
        if let Some(parent) = path::parent(&candidate.target_path) {
            if let Err(error) = target.ensurer.ensure(&parent).await {
                self.targets.degrade_on(&error);
                return Err(error);
            }
        }
        if refresh {
            tracing::debug!("re-resolving read handle for {:?}", &candidate.source_path);
            self.source.forget_read_handle(&candidate.source_path).await;
        }
        let _permit = self.limiter.acquire().await;
        let body = self.source.get(&candidate.source_path).await?;
        let spool_error = |error: std::io::Error| {
            TransportError::io(self.source.protocol(), Op::Spool, candidate.source_path.as_str(), &error)
        };
        let (body, _spooled) = if self.spool.should_spool(body.size) {
            tracing::debug!("spooling {:?}", &candidate.source_path);
            let spooled = spool::spool(body, &self.spool).await.map_err(spool_error)?;
            (spooled.open().await.map_err(spool_error)?, Some(spooled))
        } else {
            (body, None)
        };
        let prog_track = self.prog_track;
        let body = body
            .rate_limited(self.rate)
            .inspect_chunks(move |len| prog_track.bytes_copied.add(len));
        if let Err(error) = target.transport.put(&candidate.target_path, body).await {
            self.targets.degrade_on(&error);
            return Err(error);
        }
        tracing::debug!(
            "copied {:?} -> {} {:?}",
            &candidate.source_path,
            target.transport.protocol(),
            &candidate.target_path
        );
        Ok(())
    }
}

pub struct Replicator {
    locks: std::sync::Arc<JobLocks>,
    limiter: std::sync::Arc<throttle::TransferLimiter>,
    store: StateStore,
    settings: Settings,
    prog_track: &'static Progress,
}

impl Replicator {
    pub fn new(
        locks: std::sync::Arc<JobLocks>,
        limiter: std::sync::Arc<throttle::TransferLimiter>,
        store: StateStore,
        settings: Settings,
        prog_track: &'static Progress,
    ) -> Self {
        Self {
            locks,
            limiter,
            store,
            settings,
            prog_track,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[instrument(skip_all, fields(job = %job.key, mode = ?job.mode))]
    pub async fn run(
        &self,
        job: &JobSpec,
        on_progress: Option<&(dyn Fn(JobProgress) + Send + Sync)>,
    ) -> Result<JobReport, Error> {
        tracing::info!("locking");
        // released on every exit path below
        let _lock = self.locks.try_acquire(&job.key)?;

        tracing::info!("scanning {:?}", &job.plan.source_root);
        let on_scan = |status: ScanStatus| {
            if let Some(on_progress) = on_progress {
                on_progress(JobProgress::Scanning(status));
            }
        };
        let scanned = scan::scan(
            job.transports.source.clone(),
            &job.plan,
            &self.settings.scan,
            self.prog_track,
            Some(&on_scan),
        )
        .await?;

        tracing::info!("diffing {} candidates", scanned.candidates.len());
        let targets = TargetSelector::new(&job.transports);
        let (mut state, pending, skipped) = match job.mode {
            SyncMode::Full => (SyncState::empty(&job.key), scanned.candidates, 0),
            SyncMode::Incremental => {
                let state = self.store.load(&job.key).await;
                let (pending, skipped) = self
                    .diff(&state, scanned.candidates, targets.current().transport.clone())
                    .await;
                (state, pending, skipped)
            }
        };
        self.prog_track.files_skipped.add(skipped);

        let total = pending.len() as u64;
        tracing::info!("transferring {} files ({} skipped)", total, skipped);
        let controller = std::sync::Arc::new(match self.settings.rate_limit {
            Some(_) => AdaptiveController::fixed(self.settings.initial_concurrency.max(1)),
            None => AdaptiveController::new(
                self.settings.initial_concurrency,
                self.settings.max_concurrency,
            ),
        });
        let transfer = std::sync::Arc::new(Transfer {
            source: job.transports.source.clone(),
            targets,
            limiter: self.limiter.clone(),
            policy: RetryPolicy::exponential(self.settings.retries, self.settings.retry_base_delay),
            rate: self.settings.rate_limit,
            spool: self.settings.spool.clone(),
            prog_track: self.prog_track,
        });
        let work = |candidate: FileCandidate| transfer.clone().run(candidate);
        let mut pool = WorkerPool::new(pending, controller);
        let mut report = JobReport {
            skipped,
            ..Default::default()
        };
        let mut unsaved = 0;
        while let Some(joined) = pool.next(&work).await {
            match joined {
                Ok(Completed {
                    candidate,
                    result: Ok(()),
                }) => {
                    report.ok += 1;
                    self.prog_track.files_transferred.inc();
                    state.record(&candidate.target_path, &candidate.meta);
                    unsaved += 1;
                    if self.settings.flush_every > 0 && unsaved >= self.settings.flush_every {
                        unsaved = 0;
                        if let Err(error) = self.store.save(&mut state).await {
                            tracing::warn!("failed flushing sync state: {:#}", &error);
                        }
                    }
                }
                Ok(Completed {
                    candidate,
                    result: Err(error),
                }) => {
                    tracing::error!("giving up on {:?}: {}", &candidate.source_path, &error);
                    self.prog_track.files_failed.inc();
                    report.add_failure(
                        &candidate.source_path,
                        error.to_string(),
                        self.settings.failure_preview,
                    );
                }
                Err(error) => {
                    self.prog_track.files_failed.inc();
                    report.add_failure("<unknown>", error.to_string(), self.settings.failure_preview);
                }
            }
            if let Some(on_progress) = on_progress {
                on_progress(JobProgress::Transferring {
                    completed: report.ok + report.fail,
                    total,
                });
            }
        }

        tracing::info!("finalizing");
        state.last_sync_at = Some(now_millis());
        self.store.save(&mut state).await.map_err(Error::State)?;
        tracing::info!(
            "done: {} transferred, {} skipped, {} failed",
            report.ok,
            report.skipped,
            report.fail
        );
        Ok(report)
    }

    /// Drop candidates whose fingerprint matches the previous run, then those already present on
    /// the target. A failed existence probe counts as "not there".
    async fn diff(
        &self,
        state: &SyncState,
        candidates: Vec<FileCandidate>,
        target: std::sync::Arc<dyn Transport>,
    ) -> (Vec<FileCandidate>, u64) {
        let mut skipped = 0;
        let mut to_probe = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if state.is_unchanged(&candidate.target_path, &candidate.meta) {
                tracing::trace!("unchanged: {:?}", &candidate.source_path);
                skipped += 1;
            } else {
                to_probe.push(candidate);
            }
        }
        let probed: Vec<_> = futures::stream::iter(to_probe)
            .map(|candidate| {
                let target = target.clone();
                async move {
                    let exists = target.exists(&candidate.target_path).await;
                    (candidate, exists)
                }
            })
            .buffered(self.settings.scan.list_concurrency.max(1))
            .collect()
            .await;
        let mut pending = Vec::with_capacity(probed.len());
        for (candidate, exists) in probed {
            match exists {
                Ok(true) => {
                    tracing::trace!("already on target: {:?}", &candidate.target_path);
                    skipped += 1;
                }
                Ok(false) => pending.push(candidate),
                Err(error) => {
                    tracing::debug!("existence probe failed, transferring anyway: {}", &error);
                    pending.push(candidate);
                }
            }
        }
        (pending, skipped)
    }
}
