//! HTTP protocol clients implementing [`common::transport::Transport`].
//!
//! - [`dav::DavClient`] speaks WebDAV under `{base}/dav`
//! - [`fsapi::FsApiClient`] speaks the JSON file-system API under `{base}/api`
//! - [`listed::ListedSource`] adapts a [`common::lister::SourceLister`] into a read-only source
//!
//! [`select_source`] and [`target_selection`] pick the client(s) for a job.

use common::error::{ErrorKind, Op, TransportError};
use common::transport::{Protocol, Transport, TransportSelection};

pub mod dav;
pub mod fsapi;
mod http;
pub mod listed;

#[cfg(test)]
mod testutils;

pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
pub const DEFAULT_TRANSFER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Where and how to reach one endpoint.
#[derive(Clone)]
pub struct ClientSettings {
    /// scheme, host and optional path prefix, e.g. `https://files.example.com`
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// pre-issued API token, used instead of logging in
    pub token: Option<String>,
    /// metadata requests (listing, mkdir, probes, login)
    pub timeout: std::time::Duration,
    /// whole uploads and downloads
    pub transfer_timeout: std::time::Duration,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "***");
        f.debug_struct("ClientSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("token", &redacted(&self.token))
            .field("timeout", &self.timeout)
            .field("transfer_timeout", &self.transfer_timeout)
            .finish()
    }
}

impl ClientSettings {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: None,
            password: None,
            token: None,
            timeout: DEFAULT_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

/// Protocol requested for one side of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProtocolChoice {
    Dav,
    FsApi,
    /// probe the source, try WebDAV first on the target and fall back to the JSON API
    #[default]
    Auto,
}

pub fn connect(
    protocol: Protocol,
    settings: &ClientSettings,
) -> Result<std::sync::Arc<dyn Transport>, TransportError> {
    match protocol {
        Protocol::Dav => Ok(std::sync::Arc::new(dav::DavClient::new(settings)?)),
        Protocol::FsApi => Ok(std::sync::Arc::new(fsapi::FsApiClient::new(settings)?)),
        Protocol::Listed => Err(TransportError::new(
            protocol,
            Op::Login,
            "/",
            ErrorKind::Config,
            "listed sources are built from a lister, not from a URL",
        )),
    }
}

/// Connect to a source, probing WebDAV and then the JSON API with a listing of `probe_dir`.
#[tracing::instrument(skip(settings), fields(base_url = %settings.base_url))]
pub async fn select_source(
    choice: ProtocolChoice,
    settings: &ClientSettings,
    probe_dir: &str,
) -> Result<std::sync::Arc<dyn Transport>, TransportError> {
    match choice {
        ProtocolChoice::Dav => connect(Protocol::Dav, settings),
        ProtocolChoice::FsApi => connect(Protocol::FsApi, settings),
        ProtocolChoice::Auto => {
            let dav = connect(Protocol::Dav, settings)?;
            match dav.list(probe_dir).await {
                Ok(_) => {
                    tracing::info!("source speaks {}", Protocol::Dav);
                    return Ok(dav);
                }
                Err(error) if error.kind == ErrorKind::Config => return Err(error),
                Err(error) => tracing::info!("WebDAV probe failed, trying the JSON API: {}", &error),
            }
            let api = connect(Protocol::FsApi, settings)?;
            api.list(probe_dir).await?;
            tracing::info!("source speaks {}", Protocol::FsApi);
            Ok(api)
        }
    }
}

/// Target transports for a job reading from `source`.
///
/// [`ProtocolChoice::Auto`] writes through WebDAV and keeps the JSON API as the alternate.
pub fn target_selection(
    choice: ProtocolChoice,
    settings: &ClientSettings,
    source: std::sync::Arc<dyn Transport>,
) -> Result<TransportSelection, TransportError> {
    Ok(match choice {
        ProtocolChoice::Dav => {
            TransportSelection::fixed(source, connect(Protocol::Dav, settings)?)
        }
        ProtocolChoice::FsApi => {
            TransportSelection::fixed(source, connect(Protocol::FsApi, settings)?)
        }
        ProtocolChoice::Auto => TransportSelection::auto(
            source,
            connect(Protocol::Dav, settings)?,
            connect(Protocol::FsApi, settings)?,
        ),
    })
}

/// `host[:port]` of `url`, used to nest mirrored trees per source.
pub fn host_of(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
