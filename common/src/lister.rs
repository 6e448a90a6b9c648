//! Interface for sources that are not a filesystem-like endpoint.
//!
//! Such a source exposes folders and files by id and hands out time-limited download URLs for
//! files. `remote::listed::ListedSource` turns any implementation into a read-only
//! [`crate::transport::Transport`].

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    /// milliseconds since the unix epoch
    pub modified_at: Option<i64>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFolder {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub files: Vec<ListedFile>,
    pub folders: Vec<ListedFolder>,
}

/// Both calls may fail and are retried on transient errors.
#[async_trait::async_trait]
pub trait SourceLister: Send + Sync {
    /// Children of `folder_id`, the root folder when `None`.
    async fn list_children(&self, folder_id: Option<&str>) -> anyhow::Result<Listing>;

    async fn resolve_download_url(&self, file: &ListedFile) -> anyhow::Result<String>;
}
