//! Error types for conduit-client.
//!
//! "No response" is always a typed error here, never a silent empty success:
//! transient failures are retried as far down the stack as possible, and what
//! crosses a component boundary is either a real result or a value from one
//! of these enums.

use std::fmt;

use conduit_crypto::CryptoError;

// ─── TransportError ───────────────────────────────────────────────────────────

/// A transport-level failure: the exchange never produced an HTTP response
/// (or the stream connection broke mid-flight).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The server did not answer within the configured timeout.
    Timeout,
    /// Connecting, writing or reading the socket failed.
    Connection(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout       => write!(f, "request timed out"),
            Self::Connection(s) => write!(f, "connection error: {s}"),
        }
    }
}

impl std::error::Error for TransportError {}

// ─── RequestError ─────────────────────────────────────────────────────────────

/// The error type returned from any API call that talks to the servers.
#[derive(Debug)]
pub enum RequestError {
    /// Network / transport failure.
    Transport(TransportError),
    /// The server answered with a non-success HTTP status.
    Status(u16),
    /// The response body was not the JSON shape we expected.
    BadResponse(String),
    /// The crypto capability rejected the payload or key material.
    Crypto(CryptoError),
    /// Bad caller arguments — never retried.
    InvalidInput(String),
    /// The retry budget ran out; `last` is the error of the final attempt.
    GaveUp { attempts: u32, last: Box<RequestError> },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e)    => write!(f, "{e}"),
            Self::Status(code)    => write!(f, "server answered with status {code}"),
            Self::BadResponse(s)  => write!(f, "bad response: {s}"),
            Self::Crypto(e)       => write!(f, "{e}"),
            Self::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Self::GaveUp { attempts, last } => {
                write!(f, "gave up after {attempts} attempts (last error: {last})")
            }
        }
    }
}

impl std::error::Error for RequestError {}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<CryptoError> for RequestError {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl RequestError {
    /// `true` for failures worth retrying at a higher level.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status(_))
    }
}

// ─── UploadError ──────────────────────────────────────────────────────────────

/// Errors returned by [`crate::Client::upload_file`].
#[derive(Debug)]
pub enum UploadError {
    /// The source path does not exist, is not a file, or could not be read.
    InvalidInput(String),
    /// No file name could be determined for the transfer.
    MissingName,
    /// The metadata RPC or the receipt parsing failed.
    Request(RequestError),
    /// The server rejected a part (`status` other than OK).
    Rejected { status: String, detail: Option<String> },
    /// One part kept failing until its retry budget ran out.
    GaveUp { part: u64, attempts: u32 },
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(s) => write!(f, "invalid upload source: {s}"),
            Self::MissingName     => write!(f, "no file name given and none could be derived"),
            Self::Request(e)      => write!(f, "{e}"),
            Self::Rejected { status, detail } => {
                write!(f, "server rejected part: {status}")?;
                if let Some(d) = detail {
                    write!(f, " ({d})")?;
                }
                Ok(())
            }
            Self::GaveUp { part, attempts } => {
                write!(f, "part {part} still failing after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for UploadError {}

impl From<RequestError> for UploadError {
    fn from(e: RequestError) -> Self { Self::Request(e) }
}

// ─── DownloadError ────────────────────────────────────────────────────────────

/// Errors returned by [`crate::Client::download_file`].
#[derive(Debug)]
pub enum DownloadError {
    /// The datacenter identifier has no entry in the storage host table.
    UnknownDatacenter(String),
    /// The request layer failed before any range could be fetched.
    Request(RequestError),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDatacenter(dc) => write!(f, "no storage host for datacenter {dc}"),
            Self::Request(e)            => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<RequestError> for DownloadError {
    fn from(e: RequestError) -> Self { Self::Request(e) }
}

// ─── StreamError ──────────────────────────────────────────────────────────────

/// Errors returned by [`crate::Client::run_stream`].
#[derive(Debug)]
pub enum StreamError {
    /// Endpoint resolution failed before the stream could connect.
    Resolve(Box<RequestError>),
    /// The reconnect budget ran out.
    GaveUp { attempts: u32 },
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(e)          => write!(f, "{e}"),
            Self::GaveUp { attempts } => {
                write!(f, "stream reconnect gave up after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for StreamError {}
