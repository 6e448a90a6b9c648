//! Glue between `reqwest` and the transport error model.

use futures::StreamExt;

use common::error::{ErrorKind, Op, TransportError, MAX_ERROR_BODY};
use common::transport::{ByteSource, Protocol};

/// `error` followed by each of its sources, separated by `: `.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// True when a request failed because its own body stream did, not because of the endpoint.
fn is_body_failure(error: &reqwest::Error) -> bool {
    if error.is_body() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_body)
        {
            return true;
        }
        source = cause.source();
    }
    false
}

pub(crate) fn request_error(
    protocol: Protocol,
    op: Op,
    path: &str,
    error: &reqwest::Error,
) -> TransportError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if op == Op::Put && is_body_failure(error) {
        // the upload source broke, the target is not to blame
        ErrorKind::Io
    } else if error.is_builder() {
        ErrorKind::Config
    } else if error.is_decode() {
        ErrorKind::Protocol
    } else {
        ErrorKind::Network
    };
    TransportError::new(protocol, op, path, kind, error_chain(error))
}

/// Consume a non-2xx response into an error carrying (a prefix of) its body.
pub(crate) async fn status_error(
    protocol: Protocol,
    op: Op,
    path: &str,
    mut response: reqwest::Response,
) -> TransportError {
    let status = response.status().as_u16();
    let mut body = Vec::new();
    // one byte past the limit so truncation is still reported
    while body.len() <= MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    TransportError::status(protocol, op, path, status, &body)
}

fn stream_error(error: reqwest::Error) -> std::io::Error {
    let kind = if error.is_timeout() {
        std::io::ErrorKind::TimedOut
    } else {
        std::io::ErrorKind::Other
    };
    std::io::Error::new(kind, error_chain(&error))
}

/// Expose a successful response body as a [`ByteSource`].
pub(crate) fn response_body(response: reqwest::Response) -> ByteSource {
    let size = response.content_length();
    let stream = response.bytes_stream().map(|chunk| chunk.map_err(stream_error));
    ByteSource::new(stream.boxed(), size)
}

/// Attach `source` to an upload request, declaring its length when known.
pub(crate) fn with_body(
    request: reqwest::RequestBuilder,
    source: ByteSource,
) -> reqwest::RequestBuilder {
    let request = request.header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
    let request = match source.size {
        Some(size) => request.header(reqwest::header::CONTENT_LENGTH, size),
        None => request,
    };
    request.body(reqwest::Body::wrap_stream(source.stream))
}

pub(crate) fn build_client(
    protocol: Protocol,
    connect_timeout: std::time::Duration,
) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("fmirror/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| {
            TransportError::new(protocol, Op::Login, "/", ErrorKind::Config, error_chain(&error))
        })
}
