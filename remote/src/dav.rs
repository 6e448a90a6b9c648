//! WebDAV-style endpoint mounted at `{base}/dav`.

use common::error::{ErrorKind, Op, TransportError};
use common::path;
use common::transport::{ByteSource, DirEntry, EntryMeta, Protocol, Transport};

use crate::http;
use crate::ClientSettings;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
  </D:prop>
</D:propfind>"#;

macro_rules! element_regex {
    ($name:ident, $pattern:expr) => {
        static $name: std::sync::LazyLock<regex::Regex> =
            std::sync::LazyLock::new(|| regex::Regex::new($pattern).unwrap());
    };
}

// element names may carry any namespace prefix (D:, d:, lp1:, none)
element_regex!(
    RESPONSE,
    r"(?is)<(?:[a-z0-9_-]+:)?response\b[^>]*>(.*?)</(?:[a-z0-9_-]+:)?response\s*>"
);
element_regex!(
    HREF,
    r"(?is)<(?:[a-z0-9_-]+:)?href\b[^>]*>(.*?)</(?:[a-z0-9_-]+:)?href\s*>"
);
element_regex!(COLLECTION, r"(?i)<(?:[a-z0-9_-]+:)?collection\b");
element_regex!(
    CONTENT_LENGTH,
    r"(?is)<(?:[a-z0-9_-]+:)?getcontentlength\b[^>]*>\s*(\d+)\s*<"
);
element_regex!(
    LAST_MODIFIED,
    r"(?is)<(?:[a-z0-9_-]+:)?getlastmodified\b[^>]*>([^<]*)<"
);
element_regex!(NUMERIC_ENTITY, r"&#(x[0-9a-fA-F]+|[0-9]+);");

fn unescape_xml(text: &str) -> String {
    let text = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
        let code = &caps[1];
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Path component of an href, which may be a full URL or an absolute path.
fn href_path(href: &str) -> String {
    let href = unescape_xml(href.trim());
    let path = match href.find("://") {
        Some(scheme_end) => {
            let rest = &href[scheme_end + 3..];
            rest.find('/').map_or("/", |idx| &rest[idx..])
        }
        None => href.as_str(),
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path::normalize(&path::decode(path))
}

/// Children listed in a `207 Multi-Status` body. `listed_path` is the decoded URL path of the
/// directory that was listed; its own entry is dropped.
pub(crate) fn parse_multistatus(body: &str, listed_path: &str) -> Vec<DirEntry> {
    let listed_path = path::normalize(listed_path);
    let mut entries = Vec::new();
    for response in RESPONSE.captures_iter(body) {
        let block = &response[1];
        let Some(href) = HREF.captures(block) else {
            continue;
        };
        let entry_path = href_path(&href[1]);
        if entry_path == listed_path {
            continue;
        }
        let name = path::file_name(&entry_path);
        if name.is_empty() {
            continue;
        }
        if COLLECTION.is_match(block) {
            entries.push(DirEntry::dir(name));
            continue;
        }
        let meta = EntryMeta {
            size: CONTENT_LENGTH
                .captures(block)
                .and_then(|caps| caps[1].parse().ok()),
            modified_at: LAST_MODIFIED.captures(block).and_then(|caps| {
                chrono::DateTime::parse_from_rfc2822(caps[1].trim())
                    .ok()
                    .map(|time| time.timestamp_millis())
            }),
            ..Default::default()
        };
        entries.push(DirEntry::file(name, meta));
    }
    entries
}

pub struct DavClient {
    http: reqwest::Client,
    /// `{base}/dav`, without a trailing slash
    root: String,
    /// decoded URL path of `root`, used to recognize a listing's own entry
    root_path: String,
    credentials: Option<(String, Option<String>)>,
    timeout: std::time::Duration,
    transfer_timeout: std::time::Duration,
}

impl std::fmt::Debug for DavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavClient")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DavClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, TransportError> {
        let root = format!("{}/dav", settings.base_url.trim_end_matches('/'));
        let root_path = href_path(&root);
        Ok(Self {
            http: http::build_client(Protocol::Dav, settings.timeout)?,
            root,
            root_path,
            credentials: settings
                .username
                .clone()
                .map(|username| (username, settings.password.clone())),
            timeout: settings.timeout,
            transfer_timeout: settings.transfer_timeout,
        })
    }

    fn url(&self, target: &str) -> String {
        format!("{}{}", self.root, path::encode_path(target))
    }

    fn request(
        &self,
        method: reqwest::Method,
        target: &str,
        timeout: std::time::Duration,
    ) -> reqwest::RequestBuilder {
        let request = self.http.request(method, self.url(target)).timeout(timeout);
        match &self.credentials {
            Some((username, password)) => request.basic_auth(username, password.as_ref()),
            None => request,
        }
    }

    fn method(&self, op: Op, target: &str, name: &str) -> Result<reqwest::Method, TransportError> {
        reqwest::Method::from_bytes(name.as_bytes()).map_err(|error| {
            TransportError::new(Protocol::Dav, op, target, ErrorKind::Config, error.to_string())
        })
    }

    async fn send(
        &self,
        op: Op,
        target: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        request
            .send()
            .await
            .map_err(|error| http::request_error(Protocol::Dav, op, target, &error))
    }
}

#[async_trait::async_trait]
impl Transport for DavClient {
    fn protocol(&self) -> Protocol {
        Protocol::Dav
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, TransportError> {
        let dir = path::normalize(dir);
        let request = self
            .request(self.method(Op::List, &dir, "PROPFIND")?, &dir, self.timeout)
            .header("Depth", "1")
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = self.send(Op::List, &dir, request).await?;
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::Dav, Op::List, &dir, response).await);
        }
        let body = response
            .text()
            .await
            .map_err(|error| http::request_error(Protocol::Dav, Op::List, &dir, &error))?;
        let listed_path = path::join(&self.root_path, &dir);
        let entries = parse_multistatus(&body, &listed_path);
        tracing::debug!("listed {:?}: {} entries", &dir, entries.len());
        Ok(entries)
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), TransportError> {
        let dir = path::normalize(dir);
        let request = self.request(self.method(Op::Mkdir, &dir, "MKCOL")?, &dir, self.timeout);
        let response = self.send(Op::Mkdir, &dir, request).await?;
        match response.status().as_u16() {
            200..=299 => Ok(()),
            // already exists
            405 => Ok(()),
            _ => Err(http::status_error(Protocol::Dav, Op::Mkdir, &dir, response).await),
        }
    }

    async fn exists(&self, target: &str) -> Result<bool, TransportError> {
        let target = path::normalize(target);
        let request = self.request(reqwest::Method::HEAD, &target, self.timeout);
        let response = self.send(Op::Exists, &target, request).await?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => Err(http::status_error(Protocol::Dav, Op::Exists, &target, response).await),
        }
    }

    async fn get(&self, target: &str) -> Result<ByteSource, TransportError> {
        let target = path::normalize(target);
        let request = self.request(reqwest::Method::GET, &target, self.transfer_timeout);
        let response = self.send(Op::Get, &target, request).await?;
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::Dav, Op::Get, &target, response).await);
        }
        Ok(http::response_body(response))
    }

    async fn put(&self, target: &str, body: ByteSource) -> Result<(), TransportError> {
        let target = path::normalize(target);
        let request = http::with_body(
            self.request(reqwest::Method::PUT, &target, self.transfer_timeout),
            body,
        );
        let response = self.send(Op::Put, &target, request).await?;
        if !response.status().is_success() {
            return Err(http::status_error(Protocol::Dav, Op::Put, &target, response).await);
        }
        tracing::trace!("uploaded {:?}", &target);
        Ok(())
    }
}
