//! Breadth-first walk of the source tree.

use crate::error::TransportError;
use crate::path;
use crate::progress::Progress;
use crate::retry::{retry, RetryPolicy};
use crate::transport::{EntryMeta, Transport};

pub const DEFAULT_LIST_CONCURRENCY: usize = 20;
const STATUS_EVERY: u64 = 10;

/// Where the tree comes from and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub source_root: String,
    pub target_root: String,
    /// Nest everything one level deeper under this (sanitized) host name.
    pub host: Option<String>,
}

impl Plan {
    pub fn new(source_root: &str, target_root: &str) -> Self {
        Self {
            source_root: path::normalize(source_root),
            target_root: path::normalize(target_root),
            host: None,
        }
    }

    pub fn nested_under(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// `target_root[/host]/<path relative to source_root>`, `None` if `source_path` lies outside
    /// the source root.
    pub fn target_for(&self, source_path: &str) -> Option<String> {
        let relative = path::relative_to(&self.source_root, source_path)?;
        let base = match &self.host {
            Some(host) => path::join(&self.target_root, &path::sanitize_segment(host)),
            None => self.target_root.clone(),
        };
        Some(path::join(&base, &relative))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Listing requests in flight at once.
    pub list_concurrency: usize,
    /// Stop after this many files, 0 for no limit.
    pub max_files: usize,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            list_concurrency: DEFAULT_LIST_CONCURRENCY,
            max_files: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// One file to replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub source_path: String,
    pub target_path: String,
    pub meta: EntryMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStatus {
    pub directories_scanned: u64,
    pub files_found: u64,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// In discovery order.
    pub candidates: Vec<FileCandidate>,
    pub directories_scanned: u64,
    pub directories_failed: u64,
    /// The file limit was hit before the walk completed.
    pub truncated: bool,
}

type Listed = (String, Result<Vec<crate::transport::DirEntry>, TransportError>);

/// Walk `plan.source_root` and collect every file below it.
///
/// Failing to list the root is an error. A subdirectory that still fails after retries is logged
/// and skipped so one bad folder does not sink the whole job.
#[tracing::instrument(skip_all, fields(root = %plan.source_root))]
pub async fn scan(
    source: std::sync::Arc<dyn Transport>,
    plan: &Plan,
    settings: &Settings,
    prog_track: &Progress,
    on_status: Option<&(dyn Fn(ScanStatus) + Send + Sync)>,
) -> Result<ScanResult, TransportError> {
    let width = settings.list_concurrency.max(1);
    let mut result = ScanResult::default();
    let mut pending = std::collections::VecDeque::from([plan.source_root.clone()]);
    let mut visited = std::collections::HashSet::from([plan.source_root.clone()]);
    let mut join_set = tokio::task::JoinSet::<Listed>::new();
    let report = |result: &ScanResult| {
        if let Some(on_status) = on_status {
            on_status(ScanStatus {
                directories_scanned: result.directories_scanned,
                files_found: result.candidates.len() as u64,
            });
        }
    };
    'walk: loop {
        while join_set.len() < width {
            let Some(dir) = pending.pop_front() else {
                break;
            };
            let source = source.clone();
            let policy = settings.retry.clone();
            join_set.spawn(async move {
                let listing = retry(&policy, TransportError::is_retryable, |_| source.list(&dir)).await;
                (dir, listing)
            });
        }
        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (dir, listing) = match joined {
            Ok(joined) => joined,
            Err(error) => {
                tracing::error!("listing task failed: {}", &error);
                result.directories_failed += 1;
                continue;
            }
        };
        let entries = match listing {
            Ok(entries) => entries,
            Err(error) if dir == plan.source_root => return Err(error),
            Err(error) => {
                tracing::warn!("skipping directory {:?}: {}", &dir, &error);
                result.directories_failed += 1;
                continue;
            }
        };
        result.directories_scanned += 1;
        prog_track.directories_scanned.inc();
        for entry in entries {
            if matches!(entry.name.as_str(), "" | "." | "..") {
                continue;
            }
            let child = path::join(&dir, &entry.name);
            if entry.is_dir {
                if visited.insert(child.clone()) {
                    pending.push_back(child);
                }
                continue;
            }
            if settings.max_files > 0 && result.candidates.len() >= settings.max_files {
                tracing::info!("file limit {} reached, stopping scan", settings.max_files);
                result.truncated = true;
                break 'walk;
            }
            let Some(target_path) = plan.target_for(&child) else {
                continue;
            };
            tracing::trace!("found {:?} -> {:?}", &child, &target_path);
            prog_track.files_found.inc();
            result.candidates.push(FileCandidate {
                source_path: child,
                target_path,
                meta: entry.meta,
            });
        }
        if result.directories_scanned % STATUS_EVERY == 0 {
            report(&result);
        }
    }
    join_set.abort_all();
    report(&result);
    tracing::info!(
        "scanned {} directories, found {} files{}",
        result.directories_scanned,
        result.candidates.len(),
        if result.truncated { " (truncated)" } else { "" }
    );
    Ok(result)
}
