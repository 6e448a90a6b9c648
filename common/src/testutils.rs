//! In-memory transport used by the engine's tests.

use futures::StreamExt;

use crate::error::{ErrorKind, Op, TransportError};
use crate::path;
use crate::transport::{ByteSource, DirEntry, EntryMeta, Protocol, Transport};

#[derive(Debug, Clone)]
struct StoredFile {
    data: bytes::Bytes,
    meta: EntryMeta,
}

#[derive(Debug, Default)]
struct State {
    files: std::collections::BTreeMap<String, StoredFile>,
    dirs: std::collections::BTreeSet<String>,
    calls: std::collections::HashMap<(Op, String), usize>,
    // (op, path) -> remaining injected failures
    failures: std::collections::HashMap<(Op, String), (ErrorKind, usize)>,
}

/// A tree of files kept in memory. Writes require the parent directory to exist.
#[derive(Debug)]
pub struct MemoryTransport {
    protocol: Protocol,
    state: std::sync::Mutex<State>,
    mkdir_delay: std::time::Duration,
    get_delay: std::time::Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_protocol(Protocol::Dav)
    }

    pub fn with_protocol(protocol: Protocol) -> Self {
        let mut state = State::default();
        state.dirs.insert("/".to_string());
        Self {
            protocol,
            state: std::sync::Mutex::new(state),
            mkdir_delay: std::time::Duration::ZERO,
            get_delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_mkdir_delay(mut self, delay: std::time::Duration) -> Self {
        self.mkdir_delay = delay;
        self
    }

    pub fn with_get_delay(mut self, delay: std::time::Duration) -> Self {
        self.get_delay = delay;
        self
    }

    /// Add a file and all of its parent directories.
    pub fn add_file(&self, file_path: &str, data: impl Into<bytes::Bytes>, meta: EntryMeta) {
        let file_path = path::normalize(file_path);
        let data = data.into();
        let meta = EntryMeta {
            size: meta.size.or(Some(data.len() as u64)),
            ..meta
        };
        let mut state = self.lock();
        if let Some(parent) = path::parent(&file_path) {
            state.dirs.extend(path::ancestors(&parent));
        }
        state.files.insert(file_path, StoredFile { data, meta });
    }

    /// Make the next `count` calls of `op` on `path` fail with `kind`.
    pub fn fail_next(&self, op: Op, path: &str, kind: ErrorKind, count: usize) {
        self.lock()
            .failures
            .insert((op, path::normalize(path)), (kind, count));
    }

    pub fn calls(&self, op: Op, path: &str) -> usize {
        self.lock()
            .calls
            .get(&(op, path::normalize(path)))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self, op: Op) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|((call_op, _), _)| *call_op == op)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn file(&self, file_path: &str) -> Option<bytes::Bytes> {
        self.lock()
            .files
            .get(&path::normalize(file_path))
            .map(|file| file.data.clone())
    }

    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn begin(&self, op: Op, path: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        *state.calls.entry((op, path.to_string())).or_default() += 1;
        if let Some((kind, remaining)) = state.failures.get_mut(&(op, path.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                let kind = *kind;
                let message = match kind {
                    ErrorKind::Timeout => "request timed out".to_string(),
                    kind => format!("injected {kind:?}"),
                };
                return Err(TransportError::new(self.protocol, op, path, kind, message));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, TransportError> {
        let dir = path::normalize(dir);
        self.begin(Op::List, &dir)?;
        let state = self.lock();
        if !state.dirs.contains(&dir) {
            return Err(TransportError::new(
                self.protocol,
                Op::List,
                dir,
                ErrorKind::Status(404),
                "no such directory",
            ));
        }
        let is_child = |candidate: &str| path::parent(candidate).as_deref() == Some(dir.as_str());
        let mut entries: Vec<DirEntry> = state
            .dirs
            .iter()
            .filter(|d| is_child(d))
            .map(|d| DirEntry::dir(path::file_name(d)))
            .collect();
        entries.extend(
            state
                .files
                .iter()
                .filter(|(f, _)| is_child(f))
                .map(|(f, file)| DirEntry::file(path::file_name(f), file.meta.clone())),
        );
        Ok(entries)
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), TransportError> {
        let dir = path::normalize(dir);
        self.begin(Op::Mkdir, &dir)?;
        if !self.mkdir_delay.is_zero() {
            tokio::time::sleep(self.mkdir_delay).await;
        }
        let mut state = self.lock();
        let parent_exists = path::parent(&dir).is_none_or(|parent| state.dirs.contains(&parent));
        if !parent_exists {
            return Err(TransportError::new(
                self.protocol,
                Op::Mkdir,
                dir,
                ErrorKind::Status(409),
                "parent directory missing",
            ));
        }
        state.dirs.insert(dir);
        Ok(())
    }

    async fn exists(&self, file_path: &str) -> Result<bool, TransportError> {
        let file_path = path::normalize(file_path);
        self.begin(Op::Exists, &file_path)?;
        let state = self.lock();
        Ok(state.files.contains_key(&file_path) || state.dirs.contains(&file_path))
    }

    async fn get(&self, file_path: &str) -> Result<ByteSource, TransportError> {
        let file_path = path::normalize(file_path);
        self.begin(Op::Get, &file_path)?;
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        let file = self.lock().files.get(&file_path).cloned();
        match file {
            Some(file) => Ok(ByteSource::from_bytes(file.data)),
            None => Err(TransportError::new(
                self.protocol,
                Op::Get,
                file_path,
                ErrorKind::Status(404),
                "no such file",
            )),
        }
    }

    async fn put(&self, file_path: &str, mut body: ByteSource) -> Result<(), TransportError> {
        let file_path = path::normalize(file_path);
        self.begin(Op::Put, &file_path)?;
        let parent_exists = path::parent(&file_path)
            .is_none_or(|parent| self.lock().dirs.contains(&parent));
        if !parent_exists {
            return Err(TransportError::new(
                self.protocol,
                Op::Put,
                file_path,
                ErrorKind::Status(409),
                "parent directory missing",
            ));
        }
        let mut data = bytes::BytesMut::new();
        while let Some(chunk) = body.stream.next().await {
            let chunk = chunk.map_err(|error| {
                TransportError::io(self.protocol, Op::Put, file_path.as_str(), &error)
            })?;
            data.extend_from_slice(&chunk);
        }
        let data = data.freeze();
        let meta = EntryMeta {
            size: Some(data.len() as u64),
            ..Default::default()
        };
        self.lock().files.insert(file_path, StoredFile { data, meta });
        Ok(())
    }

    async fn forget_read_handle(&self, file_path: &str) {
        let mut state = self.lock();
        *state
            .calls
            .entry((Op::Resolve, path::normalize(file_path)))
            .or_default() += 1;
    }
}
