//! Error types for the service.
//!
//! Connection errors never stop the service: they feed the reconnect loop.
//! Configuration errors are the only ones surfaced as fatal, and only at
//! startup. Delivery failures are not errors at all; they travel inside a
//! `DeliveryResult`.

use crate::auth::AuthStrategy;
use shared::ParseError;
use std::path::PathBuf;

/// Failures of the admin connection or of a single command exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication failed")]
    AuthFailure,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected")]
    NotConnected,

    #[error("service shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::ConnectionLost(err.to_string())
    }
}

/// Why one login pass over a stream ended without a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no login strategy was accepted")]
    Refused,

    /// The reply may still arrive later, so the stream cannot be reused.
    #[error("no reply to the {0} login in time")]
    Stalled(AuthStrategy),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<AuthError> for ConnectionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Refused => ConnectionError::AuthFailure,
            AuthError::Stalled(_) => ConnectionError::Timeout,
            AuthError::Connection(e) => e,
        }
    }
}

/// Invalid or missing settings detected while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigurationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures of a durable store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Why a poll cycle produced no diff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failures of kick/ban/unban.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("server rejected command: {0}")]
    Rejected(String),
}
