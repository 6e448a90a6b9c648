//! Memoized "create this directory and all of its ancestors".
//!
//! Concurrent transfers into sibling paths share a single in-flight creation per directory. A
//! failed creation is evicted from the memo so a later attempt can retry it, and nothing below a
//! failed directory is attempted.

use futures::FutureExt;

use crate::error::TransportError;
use crate::path;
use crate::transport::Transport;

type Creation = futures::future::Shared<futures::future::BoxFuture<'static, Result<(), TransportError>>>;

pub struct DirectoryEnsurer {
    transport: std::sync::Arc<dyn Transport>,
    memo: std::sync::Mutex<std::collections::HashMap<String, Creation>>,
}

impl std::fmt::Debug for DirectoryEnsurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryEnsurer")
            .field("protocol", &self.transport.protocol())
            .finish_non_exhaustive()
    }
}

impl DirectoryEnsurer {
    pub fn new(transport: std::sync::Arc<dyn Transport>) -> Self {
        Self {
            transport,
            memo: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn transport(&self) -> &std::sync::Arc<dyn Transport> {
        &self.transport
    }

    /// Make sure `dir` and every ancestor exist, root first.
    pub async fn ensure(&self, dir: &str) -> Result<(), TransportError> {
        for ancestor in path::ancestors(dir) {
            let creation = self.creation(&ancestor);
            if let Err(error) = creation.clone().await {
                self.evict(&ancestor, &creation);
                tracing::warn!("failed creating directory {:?}: {}", &ancestor, &error);
                return Err(error);
            }
        }
        Ok(())
    }

    fn creation(&self, dir: &str) -> Creation {
        let mut memo = self.lock();
        memo.entry(dir.to_string())
            .or_insert_with(|| {
                let transport = self.transport.clone();
                let dir = dir.to_string();
                async move {
                    tracing::debug!("creating directory {:?}", &dir);
                    transport.ensure_dir(&dir).await
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    fn evict(&self, dir: &str, failed: &Creation) {
        let mut memo = self.lock();
        // a newer attempt may already have replaced the failed one
        if memo.get(dir).is_some_and(|current| current.ptr_eq(failed)) {
            memo.remove(dir);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, Creation>> {
        self.memo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Op};
    use crate::testutils::MemoryTransport;

    #[tokio::test]
    async fn concurrent_ensures_issue_one_create_per_directory() {
        let transport = std::sync::Arc::new(
            MemoryTransport::new().with_mkdir_delay(std::time::Duration::from_millis(20)),
        );
        let ensurer = std::sync::Arc::new(DirectoryEnsurer::new(transport.clone()));
        let first = tokio::spawn({
            let ensurer = ensurer.clone();
            async move { ensurer.ensure("/a/b").await }
        });
        let second = tokio::spawn({
            let ensurer = ensurer.clone();
            async move { ensurer.ensure("/a/b").await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(transport.calls(Op::Mkdir, "/a"), 1);
        assert_eq!(transport.calls(Op::Mkdir, "/a/b"), 1);
    }

    #[tokio::test]
    async fn siblings_share_the_parent_creation() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        let ensurer = DirectoryEnsurer::new(transport.clone());
        let (a, b, c) = tokio::join!(
            ensurer.ensure("/p/x"),
            ensurer.ensure("/p/y"),
            ensurer.ensure("/p")
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(transport.calls(Op::Mkdir, "/p"), 1);
        assert_eq!(transport.calls(Op::Mkdir, "/p/x"), 1);
        assert_eq!(transport.calls(Op::Mkdir, "/p/y"), 1);
        // completed creations stay memoized
        ensurer.ensure("/p/x").await.unwrap();
        assert_eq!(transport.calls(Op::Mkdir, "/p/x"), 1);
    }

    #[tokio::test]
    async fn failures_are_evicted_and_stop_descent() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        transport.fail_next(Op::Mkdir, "/a", ErrorKind::Status(503), 1);
        let ensurer = DirectoryEnsurer::new(transport.clone());
        let error = ensurer.ensure("/a/b").await.unwrap_err();
        assert_eq!(error.status_code(), Some(503));
        assert_eq!(transport.calls(Op::Mkdir, "/a/b"), 0);
        // the failed entry was evicted, so the retry reaches the server again
        ensurer.ensure("/a/b").await.unwrap();
        assert_eq!(transport.calls(Op::Mkdir, "/a"), 2);
        assert_eq!(transport.calls(Op::Mkdir, "/a/b"), 1);
    }

    #[tokio::test]
    async fn root_is_never_created() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        let ensurer = DirectoryEnsurer::new(transport.clone());
        ensurer.ensure("/").await.unwrap();
        assert_eq!(transport.total_calls(Op::Mkdir), 0);
    }
}
