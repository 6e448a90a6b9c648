//! Disk spooling for large payloads.
//!
//! A source stream at or above the threshold is written to a temporary file first and the upload
//! then reads from disk, so a slow target never holds the download connection open. The file is
//! removed when the [`Spooled`] handle drops.

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::transport::ByteSource;

/// 200 MiB
pub const DEFAULT_SPOOL_THRESHOLD: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolSettings {
    /// Payloads of at least this many bytes are spooled, 0 disables spooling.
    pub threshold: u64,
    /// Where temporary files go, the system temp directory when unset.
    pub dir: Option<std::path::PathBuf>,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPOOL_THRESHOLD,
            dir: None,
        }
    }
}

impl SpoolSettings {
    /// Unknown sizes are never spooled.
    pub fn should_spool(&self, size: Option<u64>) -> bool {
        match size {
            Some(size) => self.threshold > 0 && size >= self.threshold,
            None => false,
        }
    }
}

/// A payload parked on local disk.
#[derive(Debug)]
pub struct Spooled {
    path: tempfile::TempPath,
    size: u64,
}

impl Spooled {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// A fresh reader over the spooled bytes; the declared size is the measured length.
    pub async fn open(&self) -> std::io::Result<ByteSource> {
        let file = tokio::fs::File::open(&self.path).await?;
        let stream = tokio_util::io::ReaderStream::new(file).boxed();
        Ok(ByteSource::new(stream, Some(self.size)))
    }
}

/// Drain `source` into a temporary file.
pub async fn spool(mut source: ByteSource, settings: &SpoolSettings) -> std::io::Result<Spooled> {
    let named = match &settings.dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            tempfile::Builder::new().prefix("fmirror-").tempfile_in(dir)?
        }
        None => tempfile::Builder::new().prefix("fmirror-").tempfile()?,
    };
    let (file, path) = named.into_parts();
    let mut writer = tokio::io::BufWriter::new(tokio::fs::File::from_std(file));
    let mut size = 0u64;
    while let Some(chunk) = source.stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    writer.flush().await?;
    tracing::debug!("spooled {} to {:?}", bytesize::ByteSize(size), &path);
    Ok(Spooled { path, size })
}
