//! Structured errors raised by transports.
//!
//! Retry and fallback decisions are made from [`ErrorKind`] and [`Op`], never from the message
//! text, except for the "expired" marker some download URLs report in their bodies.

use crate::transport::Protocol;

/// Maximum number of response-body bytes kept in an error message.
pub const MAX_ERROR_BODY: usize = 512;

/// The transport operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Login,
    List,
    Mkdir,
    Exists,
    Get,
    Put,
    Resolve,
    Spool,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Op::Login => "login",
            Op::List => "list",
            Op::Mkdir => "mkdir",
            Op::Exists => "exists",
            Op::Get => "get",
            Op::Put => "put",
            Op::Resolve => "resolve",
            Op::Spool => "spool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// missing credentials, malformed base URL and similar - never retried
    Config,
    Timeout,
    /// connection refused/reset, DNS failure, broken body stream
    Network,
    /// non-2xx HTTP status
    Status(u16),
    NotFound,
    AlreadyExists,
    /// application-level error code inside a JSON envelope
    Api(i64),
    /// response could not be understood
    Protocol,
    /// local disk I/O (spooling) or a failing upload body, i.e. the source side of a put
    Io,
    /// the endpoint does not support the operation (e.g. writing to a read-only source)
    Unsupported,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{protocol} {op} {path:?} failed: {message}")]
pub struct TransportError {
    pub protocol: Protocol,
    pub op: Op,
    pub path: String,
    pub kind: ErrorKind,
    /// diagnostic text only
    pub message: String,
}

impl TransportError {
    pub fn new(
        protocol: Protocol,
        op: Op,
        path: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            op,
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Build an error for a non-2xx response, keeping at most [`MAX_ERROR_BODY`] bytes of body.
    pub fn status(
        protocol: Protocol,
        op: Op,
        path: impl Into<String>,
        status: u16,
        body: &[u8],
    ) -> Self {
        Self::new(
            protocol,
            op,
            path,
            ErrorKind::Status(status),
            format!("HTTP {status}: {}", truncate_body(body)),
        )
    }

    pub fn io(protocol: Protocol, op: Op, path: impl Into<String>, error: &std::io::Error) -> Self {
        let kind = if error.kind() == std::io::ErrorKind::TimedOut {
            ErrorKind::Timeout
        } else {
            ErrorKind::Io
        };
        Self::new(protocol, op, path, kind, error.to_string())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            ErrorKind::Status(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Io => true,
            ErrorKind::Status(code) => code >= 500 || code == 408 || code == 429,
            ErrorKind::Api(code) => code >= 500,
            ErrorKind::Config
            | ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::Protocol
            | ErrorKind::Unsupported => false,
        }
    }

    /// A read failure suggesting the cached download handle went stale.
    pub fn is_expired_handle(&self) -> bool {
        if !matches!(self.op, Op::Get | Op::Resolve) {
            return false;
        }
        matches!(self.kind, ErrorKind::Status(401 | 403 | 404))
            || self.message.to_ascii_lowercase().contains("expired")
    }

    /// A target-side failure suggesting the other protocol might work better.
    ///
    /// Transient failures (timeouts, resets, broken upload bodies) are retried on the same
    /// target instead.
    pub fn suggests_fallback(&self) -> bool {
        let op_applies = match self.protocol {
            Protocol::Dav => matches!(self.op, Op::Mkdir | Op::Put),
            Protocol::FsApi => matches!(self.op, Op::List | Op::Mkdir | Op::Put),
            Protocol::Listed => false,
        };
        op_applies
            && matches!(
                self.kind,
                ErrorKind::Status(401 | 403 | 404 | 405 | 501)
                    | ErrorKind::Api(401 | 403 | 404 | 405 | 500)
                    | ErrorKind::Protocol
            )
    }
}

/// Lossy UTF-8 rendering of at most [`MAX_ERROR_BODY`] bytes.
pub fn truncate_body(body: &[u8]) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return String::from_utf8_lossy(body).trim().to_string();
    }
    format!(
        "{}... ({} bytes total)",
        String::from_utf8_lossy(&body[..MAX_ERROR_BODY]).trim(),
        body.len()
    )
}
