//! Transfer admission control and bandwidth throttling
//!
//! This crate bounds the resources that replication jobs may consume, independently of how many
//! jobs are running or how wide each job's own worker pool has grown.
//!
//! # Overview
//!
//! Two mechanisms are provided:
//!
//! 1. **Transfer Limiter** - caps the number of file transfers (one download plus one upload) that
//!    may be in flight at the same time across the whole process
//! 2. **Byte Rate** - caps the throughput of a single byte stream to a configured number of bytes
//!    per second
//!
//! # Transfer Limiter
//!
//! The process-wide limiter is intentionally process scoped: every job acquires a permit from the
//! same instance, so aggregate memory and bandwidth stay bounded even when many jobs each run
//! their own adaptive pool. The default admits a single transfer at a time.
//!
//! ```rust,no_run
//! # async fn example() {
//! // admit up to 4 concurrent transfers, 0 or a negative value removes the cap
//! throttle::set_max_transfers(4);
//!
//! let limiter = throttle::global_transfers();
//! let _permit = limiter.acquire().await;
//! // download and upload one file here - the permit is released when dropped
//! # }
//! ```
//!
//! Waiters are admitted in FIFO order. While the queue is non-empty, a warning reporting the queue
//! depth and the oldest wait is logged at most once every 30 seconds.
//!
//! Independent limiters can be constructed with [`TransferLimiter::new`], which is useful for
//! tests that need fresh state.
//!
//! # Byte Rate
//!
//! ```rust,no_run
//! use futures::StreamExt;
//!
//! # async fn example() {
//! let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"abc"))]);
//! // 1 MiB/s, a rate of 0 disables throttling
//! let limited = throttle::rate::limit_stream(chunks, throttle::rate::ByteRate::new(1024 * 1024));
//! let _ = limited.collect::<Vec<_>>().await;
//! # }
//! ```

mod limiter;
pub mod rate;

pub use limiter::{TransferLimiter, TransferPermit};

/// Number of concurrent transfers admitted by the process-wide limiter unless configured otherwise.
pub const DEFAULT_MAX_TRANSFERS: i64 = 1;

static TRANSFERS: std::sync::LazyLock<std::sync::Arc<TransferLimiter>> =
    std::sync::LazyLock::new(|| std::sync::Arc::new(TransferLimiter::new(DEFAULT_MAX_TRANSFERS)));

/// Reconfigure the process-wide limiter. Values `<= 0` disable the cap.
///
/// Meant to be called once at startup, before any transfer acquires a permit.
pub fn set_max_transfers(max_transfers: i64) {
    TRANSFERS.setup(max_transfers);
}

/// The process-wide transfer limiter shared by all jobs.
pub fn global_transfers() -> std::sync::Arc<TransferLimiter> {
    TRANSFERS.clone()
}
