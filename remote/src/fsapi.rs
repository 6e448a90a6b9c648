//! JSON file-system API under `{base}/api`.
//!
//! Every call is a `POST` of a JSON body answered with an envelope `{code, message, data}`;
//! uploads are a streamed `PUT` whose target travels in the `File-Path` header. Reads go through
//! short-lived `raw_url`s handed out by `/api/fs/get`, cached per path until
//! [`Transport::forget_read_handle`] drops them.

use common::error::{ErrorKind, Op, TransportError};
use common::path;
use common::transport::{ByteSource, DirEntry, EntryMeta, Protocol, Transport};

use crate::http;
use crate::ClientSettings;

pub const PAGE_SIZE: usize = 100;
pub const MAX_PAGES: usize = 1000;

#[derive(Debug, serde::Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, serde::Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, serde::Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<FsObject>>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, serde::Deserialize)]
struct FsObject {
    name: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    hash_info: serde_json::Value,
}

impl FsObject {
    fn into_entry(self) -> DirEntry {
        if self.is_dir {
            return DirEntry::dir(self.name);
        }
        let modified_at = self.modified.as_deref().and_then(|text| {
            chrono::DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|time| time.timestamp_millis())
                // servers report the zero time for unknown values
                .filter(|millis| *millis > 0)
        });
        let hash = match self.hash_info {
            serde_json::Value::Object(map) => map
                .values()
                .filter_map(serde_json::Value::as_str)
                .find(|value| !value.is_empty())
                .map(str::to_string),
            _ => None,
        };
        DirEntry::file(
            self.name,
            EntryMeta {
                size: self.size,
                modified_at,
                hash,
                ..Default::default()
            },
        )
    }
}

#[derive(Debug, serde::Deserialize)]
struct GetData {
    #[serde(default)]
    raw_url: String,
}

/// Fetch pages `1..=max_pages` until one comes back short or `total` items have been seen.
pub(crate) async fn collect_pages<T, Fut>(
    per_page: usize,
    max_pages: usize,
    mut fetch: impl FnMut(usize) -> Fut,
) -> Result<Vec<T>, TransportError>
where
    Fut: std::future::Future<Output = Result<(Vec<T>, u64), TransportError>>,
{
    let mut items = Vec::new();
    for page in 1..=max_pages {
        let (batch, total) = fetch(page).await?;
        let fetched = batch.len();
        items.extend(batch);
        if fetched < per_page || items.len() as u64 >= total {
            return Ok(items);
        }
    }
    tracing::warn!(
        "listing did not end after {} pages, keeping the {} entries seen so far",
        max_pages,
        items.len()
    );
    Ok(items)
}

pub struct FsApiClient {
    http: reqwest::Client,
    base: String,
    credentials: Option<(String, String)>,
    token: tokio::sync::OnceCell<String>,
    raw_urls: std::sync::Mutex<std::collections::HashMap<String, String>>,
    timeout: std::time::Duration,
    transfer_timeout: std::time::Duration,
}

impl std::fmt::Debug for FsApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsApiClient")
            .field("base", &self.base)
            .field("logged_in", &self.token.initialized())
            .finish_non_exhaustive()
    }
}

impl FsApiClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, TransportError> {
        let token = match &settings.token {
            Some(token) => tokio::sync::OnceCell::new_with(Some(token.clone())),
            None => tokio::sync::OnceCell::new(),
        };
        Ok(Self {
            http: http::build_client(Protocol::FsApi, settings.timeout)?,
            base: settings.base_url.trim_end_matches('/').to_string(),
            credentials: settings.username.clone().map(|username| {
                (username, settings.password.clone().unwrap_or_default())
            }),
            token,
            raw_urls: Default::default(),
            timeout: settings.timeout,
            transfer_timeout: settings.transfer_timeout,
        })
    }

    fn error(op: Op, target: &str, kind: ErrorKind, message: impl Into<String>) -> TransportError {
        TransportError::new(Protocol::FsApi, op, target, kind, message)
    }

    fn raw_urls(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, String>> {
        self.raw_urls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn login(&self) -> Result<String, TransportError> {
        let Some((username, password)) = &self.credentials else {
            return Err(Self::error(
                Op::Login,
                "/",
                ErrorKind::Config,
                "neither a username nor a token is configured",
            ));
        };
        let body = serde_json::json!({ "username": username, "password": password });
        let data: LoginData = self.post(Op::Login, "/", "auth/login", &body, None).await?;
        tracing::info!("logged in to {} as {:?}", &self.base, username);
        Ok(data.token)
    }

    async fn token(&self) -> Result<&str, TransportError> {
        self.token
            .get_or_try_init(|| self.login())
            .await
            .map(String::as_str)
    }

    async fn envelope(
        op: Op,
        target: &str,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, TransportError> {
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::FsApi, op, target, response).await);
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|error| http::request_error(Protocol::FsApi, op, target, &error))?;
        if envelope.code != 200 {
            let kind = if envelope.message.to_ascii_lowercase().contains("not found") {
                ErrorKind::NotFound
            } else {
                ErrorKind::Api(envelope.code)
            };
            return Err(Self::error(
                op,
                target,
                kind,
                format!("code {}: {}", envelope.code, envelope.message),
            ));
        }
        Ok(envelope.data)
    }

    fn decode<T: serde::de::DeserializeOwned>(
        op: Op,
        target: &str,
        data: serde_json::Value,
    ) -> Result<T, TransportError> {
        serde_json::from_value(data).map_err(|error| {
            Self::error(
                op,
                target,
                ErrorKind::Protocol,
                format!("unexpected response data: {error}"),
            )
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        op: Op,
        target: &str,
        endpoint: &str,
        body: &serde_json::Value,
        token: Option<&str>,
    ) -> Result<T, TransportError> {
        let mut request = self
            .http
            .post(format!("{}/api/{}", self.base, endpoint))
            .timeout(self.timeout)
            .json(body);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| http::request_error(Protocol::FsApi, op, target, &error))?;
        let data = Self::envelope(op, target, response).await?;
        Self::decode(op, target, data)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        op: Op,
        target: &str,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let token = self.token().await?;
        self.post(op, target, endpoint, &body, Some(token)).await
    }

    /// Direct download URL for `target`, served from the cache when possible.
    async fn raw_url(&self, target: &str) -> Result<String, TransportError> {
        if let Some(url) = self.raw_urls().get(target) {
            return Ok(url.clone());
        }
        let data: GetData = self
            .call(
                Op::Resolve,
                target,
                "fs/get",
                serde_json::json!({ "path": target }),
            )
            .await?;
        if data.raw_url.is_empty() {
            return Err(Self::error(
                Op::Resolve,
                target,
                ErrorKind::Protocol,
                "no download URL in response",
            ));
        }
        let url = if data.raw_url.starts_with('/') {
            format!("{}{}", self.base, data.raw_url)
        } else {
            data.raw_url
        };
        self.raw_urls()
            .insert(target.to_string(), url.clone());
        Ok(url)
    }
}

fn is_absent(error: &TransportError) -> bool {
    matches!(
        error.kind,
        ErrorKind::NotFound | ErrorKind::Status(404) | ErrorKind::Api(404)
    )
}

#[async_trait::async_trait]
impl Transport for FsApiClient {
    fn protocol(&self) -> Protocol {
        Protocol::FsApi
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, TransportError> {
        let dir = path::normalize(dir);
        let client = self;
        let listed = dir.as_str();
        let objects = collect_pages(PAGE_SIZE, MAX_PAGES, move |page| {
            let body = serde_json::json!({
                "path": listed,
                "page": page,
                "per_page": PAGE_SIZE,
                "refresh": false,
            });
            async move {
                let data: ListData = client.call(Op::List, listed, "fs/list", body).await?;
                Ok((data.content.unwrap_or_default(), data.total))
            }
        })
        .await?;
        tracing::debug!("listed {:?}: {} entries", &dir, objects.len());
        Ok(objects.into_iter().map(FsObject::into_entry).collect())
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), TransportError> {
        let dir = path::normalize(dir);
        let result: Result<serde_json::Value, _> = self
            .call(Op::Mkdir, &dir, "fs/mkdir", serde_json::json!({ "path": &dir }))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error)
                if matches!(error.kind, ErrorKind::Api(_))
                    && error.message.to_ascii_lowercase().contains("exist") =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn exists(&self, target: &str) -> Result<bool, TransportError> {
        let target = path::normalize(target);
        let result: Result<serde_json::Value, _> = self
            .call(
                Op::Exists,
                &target,
                "fs/get",
                serde_json::json!({ "path": &target }),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(error) if is_absent(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn get(&self, target: &str) -> Result<ByteSource, TransportError> {
        let target = path::normalize(target);
        let url = self.raw_url(&target).await?;
        let response = self
            .http
            .get(url)
            .timeout(self.transfer_timeout)
            .send()
            .await
            .map_err(|error| http::request_error(Protocol::FsApi, Op::Get, &target, &error))?;
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::FsApi, Op::Get, &target, response).await);
        }
        Ok(http::response_body(response))
    }

    async fn put(&self, target: &str, body: ByteSource) -> Result<(), TransportError> {
        let target = path::normalize(target);
        let token = self.token().await?;
        let request = self
            .http
            .put(format!("{}/api/fs/put", self.base))
            .timeout(self.transfer_timeout)
            .header(reqwest::header::AUTHORIZATION, token)
            .header("File-Path", path::encode_path(&target))
            .header("As-Task", "false");
        let response = http::with_body(request, body)
            .send()
            .await
            .map_err(|error| http::request_error(Protocol::FsApi, Op::Put, &target, &error))?;
        Self::envelope(Op::Put, &target, response).await?;
        tracing::trace!("uploaded {:?}", &target);
        Ok(())
    }

    async fn forget_read_handle(&self, target: &str) {
        self.raw_urls()
            .remove(&path::normalize(target));
    }
}
