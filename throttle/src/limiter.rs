use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// how often a blocked waiter wakes up to check whether a queue warning is due
const WAIT_TICK: std::time::Duration = std::time::Duration::from_secs(5);
const WARN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Default)]
struct WaitQueue {
    next_ticket: u64,
    // ticket -> time the waiter started waiting, ordered by arrival
    waiting: std::collections::BTreeMap<u64, tokio::time::Instant>,
    last_warning: Option<tokio::time::Instant>,
}

/// Admission control for concurrent transfers.
///
/// A disabled limiter hands out empty permits immediately.
#[derive(Debug)]
pub struct TransferLimiter {
    enabled: AtomicBool,
    limit: AtomicUsize,
    sem: std::sync::Arc<tokio::sync::Semaphore>,
    queue: std::sync::Mutex<WaitQueue>,
}

/// Held for the duration of one transfer. Dropping it admits the next waiter.
#[derive(Debug)]
pub struct TransferPermit {
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl TransferPermit {
    /// Whether this permit counts against a configured cap.
    pub fn is_limited(&self) -> bool {
        self.permit.is_some()
    }
}

struct QueueEntry<'a> {
    limiter: &'a TransferLimiter,
    ticket: u64,
}

impl Drop for QueueEntry<'_> {
    fn drop(&mut self) {
        // also runs when the waiting future is cancelled
        self.limiter.lock_queue().waiting.remove(&self.ticket);
    }
}

impl TransferLimiter {
    /// Create a limiter admitting `limit` concurrent transfers, `<= 0` means unlimited.
    pub fn new(limit: i64) -> Self {
        let limiter = Self {
            enabled: AtomicBool::new(false),
            limit: AtomicUsize::new(0),
            sem: std::sync::Arc::new(tokio::sync::Semaphore::new(0)),
            queue: std::sync::Mutex::new(WaitQueue::default()),
        };
        limiter.setup(limit);
        limiter
    }

    /// Change the cap. Meant to be called at startup, before any permit is handed out.
    ///
    /// Lowering the cap only forgets permits that are currently free. Permits held at that
    /// moment go back to the pool when released, leaving the effective cap above
    /// [`TransferLimiter::limit`].
    pub fn setup(&self, limit: i64) {
        let new_limit = usize::try_from(limit).unwrap_or(0);
        self.enabled.store(new_limit > 0, Ordering::Release);
        if new_limit == 0 {
            return;
        }
        let old_limit = self.limit.swap(new_limit, Ordering::AcqRel);
        if new_limit > old_limit {
            self.sem.add_permits(new_limit - old_limit);
        } else {
            self.sem.forget_permits(old_limit - new_limit);
        }
    }

    /// The configured cap, `None` when disabled.
    pub fn limit(&self) -> Option<usize> {
        if self.enabled.load(Ordering::Acquire) {
            Some(self.limit.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Number of callers currently blocked in [`TransferLimiter::acquire`].
    pub fn queue_depth(&self) -> usize {
        self.lock_queue().waiting.len()
    }

    pub async fn acquire(&self) -> TransferPermit {
        if !self.enabled.load(Ordering::Acquire) {
            return TransferPermit { permit: None };
        }
        if let Ok(permit) = self.sem.clone().try_acquire_owned() {
            return TransferPermit {
                permit: Some(permit),
            };
        }
        let _entry = self.enqueue();
        let acquire = self.sem.clone().acquire_owned();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                permit = &mut acquire => {
                    // the semaphore is never closed
                    return TransferPermit { permit: permit.ok() };
                }
                _ = tokio::time::sleep(WAIT_TICK) => self.warn_if_due(),
            }
        }
    }

    fn enqueue(&self) -> QueueEntry<'_> {
        let mut queue = self.lock_queue();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.waiting.insert(ticket, tokio::time::Instant::now());
        tracing::trace!("transfer queued, depth: {}", queue.waiting.len());
        QueueEntry {
            limiter: self,
            ticket,
        }
    }

    fn warn_if_due(&self) {
        let now = tokio::time::Instant::now();
        let mut queue = self.lock_queue();
        let Some(oldest) = queue.waiting.values().next().copied() else {
            return;
        };
        if queue
            .last_warning
            .is_some_and(|last| now.duration_since(last) < WARN_INTERVAL)
        {
            return;
        }
        queue.last_warning = Some(now);
        tracing::warn!(
            "transfer limiter saturated (limit: {:?}), queue depth: {}, oldest wait: {:?}",
            self.limit(),
            queue.waiting.len(),
            now.duration_since(oldest),
        );
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, WaitQueue> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn timed_transfer(
        limiter: std::sync::Arc<TransferLimiter>,
    ) -> (tokio::time::Instant, tokio::time::Instant) {
        let _permit = limiter.acquire().await;
        let start = tokio::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        (start, tokio::time::Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn width_one_never_overlaps() {
        let limiter = std::sync::Arc::new(TransferLimiter::new(1));
        let first = tokio::spawn(timed_transfer(limiter.clone()));
        let second = tokio::spawn(timed_transfer(limiter.clone()));
        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        let (earlier, later) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        assert!(earlier.1 <= later.0, "transfers overlapped");
    }

    #[tokio::test(start_paused = true)]
    async fn width_two_runs_in_parallel() {
        let limiter = std::sync::Arc::new(TransferLimiter::new(2));
        let start = tokio::time::Instant::now();
        let first = tokio::spawn(timed_transfer(limiter.clone()));
        let second = tokio::spawn(timed_transfer(limiter.clone()));
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            tokio::time::Instant::now().duration_since(start),
            std::time::Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn disabled_limiter_hands_out_empty_permits() {
        for limit in [0, -1] {
            let limiter = TransferLimiter::new(limit);
            assert_eq!(limiter.limit(), None);
            let first = limiter.acquire().await;
            let second = limiter.acquire().await;
            assert!(!first.is_limited());
            assert!(!second.is_limited());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_tracks_waiters() {
        let limiter = std::sync::Arc::new(TransferLimiter::new(1));
        let held = limiter.acquire().await;
        assert!(held.is_limited());
        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                let _permit = limiter.acquire().await;
            }
        });
        tokio::time::sleep(std::time::Duration::from_secs(12)).await;
        assert_eq!(limiter.queue_depth(), 1);
        drop(held);
        waiter.await.unwrap();
        assert_eq!(limiter.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let limiter = std::sync::Arc::new(TransferLimiter::new(1));
        let held = limiter.acquire().await;
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for idx in 0..3 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                order.lock().unwrap().push(idx);
            }));
            // make arrival order deterministic
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn raising_the_limit_adds_permits() {
        let limiter = TransferLimiter::new(1);
        limiter.setup(3);
        assert_eq!(limiter.limit(), Some(3));
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        let _c = limiter.acquire().await;
        assert_eq!(limiter.queue_depth(), 0);
    }
}
