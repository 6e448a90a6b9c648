//! Bounded retry with per-attempt backoff.

/// Backoff used when no explicit delays are configured.
pub const DEFAULT_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(300),
    std::time::Duration::from_millis(900),
    std::time::Duration::from_millis(2000),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retries: usize,
    /// Delay before attempt `n + 1` is `delays[min(n, len - 1)]`.
    pub delays: Vec<std::time::Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RetryPolicy {
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            delays: DEFAULT_DELAYS.to_vec(),
        }
    }

    pub fn with_delays(retries: usize, delays: Vec<std::time::Duration>) -> Self {
        Self { retries, delays }
    }

    /// `base`, `2 * base`, `4 * base`, ... one delay per retry.
    pub fn exponential(retries: usize, base: std::time::Duration) -> Self {
        let delays = (0..retries.max(1))
            .map(|attempt| base.saturating_mul(1u32 << attempt.min(16)))
            .collect();
        Self { retries, delays }
    }

    pub fn delay(&self, attempt: usize) -> std::time::Duration {
        match self.delays.len() {
            0 => std::time::Duration::ZERO,
            len => self.delays[attempt.min(len - 1)],
        }
    }
}

/// Retry predicate treating every error as transient.
pub fn always<E>(_: &E) -> bool {
    true
}

/// Run `op` until it succeeds, the error is not retryable, or the retries are exhausted.
///
/// `op` receives the zero-based attempt number. The last error is returned.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.retries || !is_retryable(&error) {
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                tracing::debug!(
                    "attempt {} failed, retrying in {:?}: {:#}",
                    attempt + 1,
                    delay,
                    error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
