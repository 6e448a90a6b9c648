//! Read-only [`Transport`] over a [`SourceLister`].
//!
//! A lister addresses folders by id, so the adapter remembers the id of every folder and the
//! record of every file it has listed, keyed by the path it reported for them. Paths are only
//! resolvable after their parent has been listed, which is what the scanner does anyway.

use common::error::{ErrorKind, Op, TransportError};
use common::lister::{ListedFile, SourceLister};
use common::path;
use common::transport::{ByteSource, DirEntry, EntryMeta, Protocol, Transport};

use crate::http;

#[derive(Default)]
struct Known {
    /// folder path -> lister folder id
    folders: std::collections::HashMap<String, String>,
    files: std::collections::HashMap<String, ListedFile>,
    /// file path -> resolved download URL
    urls: std::collections::HashMap<String, String>,
}

pub struct ListedSource {
    lister: std::sync::Arc<dyn SourceLister>,
    http: reqwest::Client,
    transfer_timeout: std::time::Duration,
    known: std::sync::Mutex<Known>,
}

impl std::fmt::Debug for ListedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let known = self.known();
        f.debug_struct("ListedSource")
            .field("folders", &known.folders.len())
            .field("files", &known.files.len())
            .finish_non_exhaustive()
    }
}

fn lister_error(op: Op, target: &str, error: &anyhow::Error) -> TransportError {
    // the lister does not classify its failures, treat them as transient
    TransportError::new(
        Protocol::Listed,
        op,
        target,
        ErrorKind::Network,
        format!("{error:#}"),
    )
}

fn unsupported(op: Op, target: &str) -> TransportError {
    TransportError::new(
        Protocol::Listed,
        op,
        target,
        ErrorKind::Unsupported,
        "listed sources are read-only",
    )
}

impl ListedSource {
    pub fn new(
        lister: std::sync::Arc<dyn SourceLister>,
        timeout: std::time::Duration,
        transfer_timeout: std::time::Duration,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            lister,
            http: http::build_client(Protocol::Listed, timeout)?,
            transfer_timeout,
            known: Default::default(),
        })
    }

    fn known(&self) -> std::sync::MutexGuard<'_, Known> {
        self.known
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn folder_id(&self, dir: &str) -> Result<Option<String>, TransportError> {
        if dir == "/" {
            return Ok(None);
        }
        match self.known().folders.get(dir) {
            Some(id) => Ok(Some(id.clone())),
            None => Err(TransportError::new(
                Protocol::Listed,
                Op::List,
                dir,
                ErrorKind::NotFound,
                "folder has not been listed yet",
            )),
        }
    }

    async fn download_url(&self, target: &str) -> Result<String, TransportError> {
        let file = {
            let known = self.known();
            if let Some(url) = known.urls.get(target) {
                return Ok(url.clone());
            }
            known.files.get(target).cloned()
        };
        let Some(file) = file else {
            return Err(TransportError::new(
                Protocol::Listed,
                Op::Resolve,
                target,
                ErrorKind::NotFound,
                "file has not been listed",
            ));
        };
        let url = self
            .lister
            .resolve_download_url(&file)
            .await
            .map_err(|error| lister_error(Op::Resolve, target, &error))?;
        self.known()
            .urls
            .insert(target.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait::async_trait]
impl Transport for ListedSource {
    fn protocol(&self) -> Protocol {
        Protocol::Listed
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, TransportError> {
        let dir = path::normalize(dir);
        let folder_id = self.folder_id(&dir)?;
        let listing = self
            .lister
            .list_children(folder_id.as_deref())
            .await
            .map_err(|error| lister_error(Op::List, &dir, &error))?;
        let mut entries = Vec::with_capacity(listing.folders.len() + listing.files.len());
        let mut known = self.known();
        for folder in listing.folders {
            let name = path::sanitize_segment(&folder.name);
            known.folders.insert(path::join(&dir, &name), folder.id);
            entries.push(DirEntry::dir(name));
        }
        for file in listing.files {
            let name = path::sanitize_segment(&file.name);
            let meta = EntryMeta {
                remote_id: Some(file.id.clone()),
                size: file.size,
                modified_at: file.modified_at,
                hash: file.hash.clone(),
            };
            known.files.insert(path::join(&dir, &name), file);
            entries.push(DirEntry::file(name, meta));
        }
        tracing::debug!("listed {:?}: {} entries", &dir, entries.len());
        Ok(entries)
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), TransportError> {
        Err(unsupported(Op::Mkdir, dir))
    }

    async fn exists(&self, target: &str) -> Result<bool, TransportError> {
        let target = path::normalize(target);
        let known = self.known();
        Ok(known.files.contains_key(&target) || known.folders.contains_key(&target))
    }

    async fn get(&self, target: &str) -> Result<ByteSource, TransportError> {
        let target = path::normalize(target);
        let url = self.download_url(&target).await?;
        let response = self
            .http
            .get(url)
            .timeout(self.transfer_timeout)
            .send()
            .await
            .map_err(|error| http::request_error(Protocol::Listed, Op::Get, &target, &error))?;
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::Listed, Op::Get, &target, response).await);
        }
        let size = self
            .known()
            .files
            .get(&target)
            .and_then(|file| file.size);
        let mut source = http::response_body(response);
        source.size = source.size.or(size);
        Ok(source)
    }

    async fn put(&self, target: &str, _body: ByteSource) -> Result<(), TransportError> {
        Err(unsupported(Op::Put, target))
    }

    async fn forget_read_handle(&self, target: &str) {
        self.known()
            .urls
            .remove(&path::normalize(target));
    }
}
