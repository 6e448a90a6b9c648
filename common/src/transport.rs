//! The capability interface every storage endpoint implements.

use futures::StreamExt;

use crate::error::TransportError;

/// Which protocol family raised an error, used by the fallback policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    /// WebDAV-style endpoint under `{base}/dav`
    Dav,
    /// JSON API under `{base}/api/fs`
    FsApi,
    /// read-only adapter over an external source lister
    Listed,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Dav => "dav",
            Protocol::FsApi => "fs-api",
            Protocol::Listed => "listed",
        };
        f.write_str(name)
    }
}


/// Optional facts about a file that a listing may reveal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub remote_id: Option<String>,
    pub size: Option<u64>,
    /// milliseconds since the unix epoch
    pub modified_at: Option<i64>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub meta: EntryMeta,
}

impl DirEntry {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            meta: EntryMeta::default(),
        }
    }

    pub fn file(name: impl Into<String>, meta: EntryMeta) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            meta,
        }
    }
}

pub type ByteStream = futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>;

/// A readable payload together with its declared length, if known.
pub struct ByteSource {
    pub stream: ByteStream,
    pub size: Option<u64>,
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ByteSource {
    pub fn new(stream: ByteStream, size: Option<u64>) -> Self {
        Self { stream, size }
    }

    pub fn from_bytes(data: impl Into<bytes::Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self {
            stream: futures::stream::once(async move { Ok(data) }).boxed(),
            size: Some(size),
        }
    }

    /// Throttle the payload to `rate`, `None` leaves it untouched.
    pub fn rate_limited(self, rate: Option<throttle::rate::ByteRate>) -> Self {
        Self {
            stream: throttle::rate::limit_stream(self.stream, rate),
            size: self.size,
        }
    }

    /// Call `observe` with the length of every chunk as it passes through.
    pub fn inspect_chunks(self, observe: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            stream: self
                .stream
                .inspect(move |chunk| {
                    if let Ok(bytes) = chunk {
                        observe(bytes.len() as u64);
                    }
                })
                .boxed(),
            size: self.size,
        }
    }

    /// Buffer the whole payload in memory.
    pub async fn into_bytes(mut self) -> std::io::Result<bytes::Bytes> {
        let mut buffer = bytes::BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

/// Operations the replication engine needs from an endpoint.
///
/// All paths are absolute and slash-normalized (see [`crate::path::normalize`]).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Immediate children of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, TransportError>;

    /// Create a single directory. Must succeed if it already exists.
    async fn ensure_dir(&self, path: &str) -> Result<(), TransportError>;

    /// Cheap metadata-only existence probe.
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;

    async fn get(&self, path: &str) -> Result<ByteSource, TransportError>;

    async fn put(&self, path: &str, body: ByteSource) -> Result<(), TransportError>;

    /// Drop any cached read handle (e.g. a time-limited download URL) for `path`.
    async fn forget_read_handle(&self, _path: &str) {}
}

/// Source and target endpoints of one job.
///
/// A job created with [`TransportSelection::auto`] may switch its target to the alternate
/// transport when the primary one fails in a protocol-specific way.
#[derive(Clone)]
pub struct TransportSelection {
    pub source: std::sync::Arc<dyn Transport>,
    pub target: std::sync::Arc<dyn Transport>,
    pub fallback_target: Option<std::sync::Arc<dyn Transport>>,
}

impl std::fmt::Debug for TransportSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelection")
            .field("source", &self.source.protocol())
            .field("target", &self.target.protocol())
            .field(
                "fallback_target",
                &self.fallback_target.as_ref().map(|t| t.protocol()),
            )
            .finish()
    }
}

impl TransportSelection {
    pub fn fixed(
        source: std::sync::Arc<dyn Transport>,
        target: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            source,
            target,
            fallback_target: None,
        }
    }

    pub fn auto(
        source: std::sync::Arc<dyn Transport>,
        target: std::sync::Arc<dyn Transport>,
        alternate: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            source,
            target,
            fallback_target: Some(alternate),
        }
    }

    pub fn allow_fallback(&self) -> bool {
        self.fallback_target.is_some()
    }
}
