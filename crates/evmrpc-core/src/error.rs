//! Transport-level error types.

use std::time::Duration;

use thiserror::Error;

use crate::request::{JsonRpcError, RpcId};

/// HTTP statuses worth another attempt.
const RETRYABLE_STATUSES: [u16; 8] = [403, 408, 413, 429, 500, 502, 503, 504];

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Invalid construction input (missing URL, no child transports, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport's method filter rejected the call before any I/O.
    #[error("method not supported: {method}")]
    MethodNotSupported { method: String },

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {} from {url}: {}", .error.code, .error.message)]
    Rpc {
        #[source]
        error: JsonRpcError,
        url: String,
        body: String,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        body: String,
        url: String,
        retry_after: Option<Duration>,
    },

    /// Connection refused, reset, DNS failure, ...
    #[error("network error: {0}")]
    Network(String),

    /// WebSocket dial/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The socket went away while the call or subscription was active.
    #[error("socket closed")]
    SocketClosed,

    /// Response could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The caller cancelled the call.
    #[error("request cancelled")]
    Cancelled,

    /// A batch reply did not contain an entry for this request.
    #[error("missing response for request {id}")]
    MissingResponse { id: RpcId },

    /// The transport was closed.
    #[error("transport shut down")]
    Shutdown,

    /// One or more child transports failed to close.
    #[error("failed to close {} transport(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<TransportError>),
}

fn join_errors(errors: &[TransportError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification of [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    MethodNotAllowed,
    Rpc,
    Transport,
    Timeout,
    Cancelled,
    MissingResponse,
    Shutdown,
}

impl TransportError {
    /// Wrap a node error with the request it answered.
    pub fn rpc(error: JsonRpcError, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Rpc {
            error,
            url: url.into(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::MethodNotSupported { .. } => ErrorKind::MethodNotAllowed,
            Self::Rpc { .. } => ErrorKind::Rpc,
            Self::Http { .. }
            | Self::Network(_)
            | Self::WebSocket(_)
            | Self::SocketClosed
            | Self::Deserialization(_) => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MissingResponse { .. } => ErrorKind::MissingResponse,
            Self::Shutdown | Self::Close(_) => ErrorKind::Shutdown,
        }
    }

    /// Returns `true` if another attempt may succeed.
    ///
    /// RPC errors are retryable only for the transient codes; HTTP failures
    /// only for the transient statuses; unclassified transport failures
    /// (resets, timeouts, garbled bodies) always are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc { error, .. } => error.is_retryable(),
            Self::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Network(_)
            | Self::WebSocket(_)
            | Self::SocketClosed
            | Self::Deserialization(_)
            | Self::Timeout { .. } => true,
            Self::Config(_)
            | Self::MethodNotSupported { .. }
            | Self::Cancelled
            | Self::MissingResponse { .. }
            | Self::Shutdown
            | Self::Close(_) => false,
        }
    }

    /// Server-requested wait carried by an HTTP failure.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The node's error object, if this is an RPC error.
    pub fn rpc_error(&self) -> Option<&JsonRpcError> {
        match self {
            Self::Rpc { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if this is a node-side execution error.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}
