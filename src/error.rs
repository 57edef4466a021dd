//! Error types for nano-mesh.

use std::time::Duration;

use http::StatusCode;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Address could not be turned into a request URI.
    #[error("invalid address: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    /// Outgoing request could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Forwarding client transport error.
    #[error("client transport error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    /// Connection-level HTTP error.
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope encode or decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Durable store error from a non-redis backend.
    #[error("store error: {0}")]
    Store(String),

    /// The peer started answering but the body never completed. The request
    /// was delivered, so it must not be retried elsewhere.
    #[error("response body incomplete: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A forwarding hop did not answer in time.
    #[error("forward timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused to register this node.
    #[error("registration rejected by broker: {status}")]
    Registration {
        /// Status line returned by the broker.
        status: StatusCode,
    },

    /// A resolved hop answered with a non-success status.
    #[error("upstream answered {0}")]
    Status(StatusCode),

    /// Business handler failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a handler error.
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }

    /// Whether this error came from the network path before the peer began
    /// answering. Only these failures are safe to retry at another address.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Client(_) | Self::Hyper(_) | Self::Io(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }

    /// Whether the request reached the peer before the failure.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Body(_))
    }
}
