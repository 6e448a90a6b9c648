//! Replication engine shared by the `fmirror` tools.
//!
//! The engine copies a file tree from one HTTP storage endpoint to another. Endpoints are accessed
//! through the [`transport::Transport`] capability trait; the concrete protocol clients live in
//! the `remote` crate.
//!
//! # Job flow
//!
//! A [`mirror::Replicator`] runs one [`mirror::JobSpec`] at a time per job key:
//!
//! 1. **Locking** - [`lock::JobLocks`] rejects a second concurrent run of the same key
//! 2. **Scanning** - [`scan::scan`] walks the source breadth-first with bounded listing
//!    concurrency and maps every file onto its target path
//! 3. **Diffing** - in [`SyncMode::Incremental`] files whose fingerprint matches the last run
//!    ([`state::is_same_file`]) or that already exist on the target are skipped
//! 4. **Transferring** - an [`adaptive::WorkerPool`] runs transfers, widening or narrowing itself
//!    from recent outcomes. Every transfer creates its parent directories through a memoized
//!    [`ensure::DirectoryEnsurer`], holds a permit of the process-wide transfer limiter, spools
//!    large payloads to disk ([`spool`]) and optionally throttles bandwidth
//! 5. **Finalizing** - the sync state is persisted atomically by [`state::StateStore`]
//!
//! Individual files that keep failing after their retries ([`retry`]) are reported, they do not
//! fail the job.
//!
//! # Bootstrapping
//!
//! Binaries call [`run`], which sets up logging, the process-wide throttle and the tokio runtime,
//! optionally prints progress, and reports the final summary.

pub mod adaptive;
pub mod config;
pub mod ensure;
pub mod error;
pub mod lister;
pub mod lock;
pub mod mirror;
pub mod path;
pub mod progress;
pub mod retry;
pub mod scan;
pub mod spool;
pub mod state;
pub mod transport;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};
pub use mirror::{JobReport, JobSpec, Replicator, SyncMode};

/// How often progress is printed unless configured otherwise.
pub const DEFAULT_PROGRESS_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide progress counters.
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSettings {
    pub progress_delay: Option<std::time::Duration>,
}

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_directive()));
    // a subscriber may already be installed (e.g. by tests), keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn print_progress(delay: std::time::Duration) {
    let mut printer = progress::ProgressPrinter::new(get_progress());
    let mut interval = tokio::time::interval(delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        match printer.print() {
            Ok(text) => eprintln!("{text}"),
            Err(error) => tracing::warn!("failed rendering progress: {:#}", &error),
        }
    }
}

/// Run `func` on a freshly built runtime and report its outcome.
///
/// Returns `None` when the runtime could not be built or `func` failed; the error has been printed
/// to stderr unless `output.quiet` is set.
pub fn run<Fut, Summary>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    throttle.apply();
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to build tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = rt.block_on(async move {
        let printer = progress.map(|settings| {
            tokio::spawn(print_progress(
                settings.progress_delay.unwrap_or(DEFAULT_PROGRESS_DELAY),
            ))
        });
        let res = func().await;
        if let Some(printer) = printer {
            printer.abort();
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
