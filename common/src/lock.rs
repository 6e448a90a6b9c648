//! Process-wide mutual exclusion between runs of the same job.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {0:?} is already running")]
pub struct Busy(pub String);

#[derive(Debug, Default)]
pub struct JobLocks {
    active: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` without waiting.
    pub fn try_acquire(self: &std::sync::Arc<Self>, key: &str) -> Result<JobGuard, Busy> {
        if !self.lock().insert(key.to_string()) {
            return Err(Busy(key.to_string()));
        }
        tracing::debug!("acquired job lock {:?}", key);
        Ok(JobGuard {
            locks: self.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashSet<String>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Releases the job lock when dropped, whatever the job's outcome.
#[derive(Debug)]
pub struct JobGuard {
    locks: std::sync::Arc<JobLocks>,
    key: String,
}

impl JobGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
        tracing::debug!("released job lock {:?}", &self.key);
    }
}
