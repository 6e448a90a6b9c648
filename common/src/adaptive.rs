//! Adaptive worker-pool width.
//!
//! The controller watches a sliding window of recent transfer outcomes and nudges the pool width
//! by one in either direction. This is best-effort throughput tuning, not a formal control loop:
//! there are no convergence or fairness guarantees.
//!
//! - every 5th recorded outcome, once at least 10 samples exist, the window is evaluated
//! - any timeout in the window, or a failure rate of 0.2 or more, shrinks the width (floor 1)
//! - a window without failures grows the width (up to the configured maximum) when the mean
//!   duration is under 60 seconds, or when the window is full regardless of latency

pub const WINDOW_SIZE: usize = 20;
const EVALUATE_EVERY: u64 = 5;
const MIN_SAMPLES: usize = 10;
const MAX_FAILURE_RATE: f64 = 0.2;
const SLOW_TRANSFER: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub ok: bool,
    pub duration: std::time::Duration,
    pub reason: Option<String>,
    pub timed_out: bool,
}

impl TransferOutcome {
    pub fn success(duration: std::time::Duration) -> Self {
        Self {
            ok: true,
            duration,
            reason: None,
            timed_out: false,
        }
    }

    pub fn failure(duration: std::time::Duration, reason: impl Into<String>, timed_out: bool) -> Self {
        Self {
            ok: false,
            duration,
            reason: Some(reason.into()),
            timed_out,
        }
    }
}

#[derive(Debug)]
struct Window {
    width: usize,
    outcomes: std::collections::VecDeque<TransferOutcome>,
    recorded: u64,
}

#[derive(Debug)]
pub struct AdaptiveController {
    max_width: usize,
    adaptive: bool,
    window: std::sync::Mutex<Window>,
}

impl AdaptiveController {
    /// Start at `initial` workers and never exceed `max_width`.
    pub fn new(initial: usize, max_width: usize) -> Self {
        let max_width = max_width.max(1);
        Self {
            max_width,
            adaptive: true,
            window: std::sync::Mutex::new(Window {
                width: initial.clamp(1, max_width),
                outcomes: std::collections::VecDeque::with_capacity(WINDOW_SIZE),
                recorded: 0,
            }),
        }
    }

    /// A controller whose width never changes.
    pub fn fixed(width: usize) -> Self {
        Self {
            adaptive: false,
            ..Self::new(width, width)
        }
    }

    pub fn width(&self) -> usize {
        self.lock().width
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    /// Record an outcome, returns the new width when it changed.
    pub fn record(&self, outcome: TransferOutcome) -> Option<usize> {
        let mut window = self.lock();
        if window.outcomes.len() == WINDOW_SIZE {
            window.outcomes.pop_front();
        }
        window.outcomes.push_back(outcome);
        window.recorded += 1;
        if !self.adaptive
            || window.recorded % EVALUATE_EVERY != 0
            || window.outcomes.len() < MIN_SAMPLES
        {
            return None;
        }
        let samples = window.outcomes.len();
        let failures = window.outcomes.iter().filter(|o| !o.ok).count();
        let failure_rate = failures as f64 / samples as f64;
        let total: std::time::Duration = window.outcomes.iter().map(|o| o.duration).sum();
        let mean = total / samples as u32;
        let saw_timeout = window.outcomes.iter().any(|o| o.timed_out);
        let previous = window.width;
        if saw_timeout || failure_rate >= MAX_FAILURE_RATE {
            window.width = previous.saturating_sub(1).max(1);
        } else if failures == 0
            && previous < self.max_width
            && (mean < SLOW_TRANSFER || samples == WINDOW_SIZE)
        {
            window.width = previous + 1;
        }
        if window.width == previous {
            return None;
        }
        tracing::info!(
            "adjusting concurrency {} -> {} (failure rate: {:.2}, mean duration: {:?}, timeouts: {})",
            previous,
            window.width,
            failure_rate,
            mean,
            saw_timeout
        );
        Some(window.width)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A dynamic-width worker scheduler.
///
/// New items are started while fewer than [`AdaptiveController::width`] workers run, re-reading
/// the width on every refill so adjustments apply immediately. Each worker reports a
/// [`TransferOutcome`] which is fed back into the controller.
pub struct WorkerPool<T, R> {
    pending: std::collections::VecDeque<T>,
    running: tokio::task::JoinSet<(TransferOutcome, R)>,
    controller: std::sync::Arc<AdaptiveController>,
}

impl<T, R> WorkerPool<T, R>
where
    R: Send + 'static,
{
    pub fn new(
        items: impl IntoIterator<Item = T>,
        controller: std::sync::Arc<AdaptiveController>,
    ) -> Self {
        Self {
            pending: items.into_iter().collect(),
            running: tokio::task::JoinSet::new(),
            controller,
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Top the pool up and wait for the next worker to finish.
    ///
    /// Returns `None` once every item has completed. A worker that panicked yields `Err`.
    pub async fn next<F, Fut>(&mut self, work: &F) -> Option<Result<R, tokio::task::JoinError>>
    where
        F: Fn(T) -> Fut,
        Fut: std::future::Future<Output = (TransferOutcome, R)> + Send + 'static,
    {
        while self.running.len() < self.controller.width() {
            let Some(item) = self.pending.pop_front() else {
                break;
            };
            self.running.spawn(work(item));
        }
        match self.running.join_next().await? {
            Ok((outcome, result)) => {
                self.controller.record(outcome);
                Some(Ok(result))
            }
            Err(error) => {
                tracing::error!("transfer worker failed: {}", &error);
                self.controller.record(TransferOutcome::failure(
                    std::time::Duration::ZERO,
                    error.to_string(),
                    false,
                ));
                Some(Err(error))
            }
        }
    }
}
