//! Error types for discord-archive
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Api, Export, Config, etc.)
//! - Classification helpers used by the orchestrator (recoverable vs fatal)
//! - A distinct cancellation variant so callers can abort promptly without
//!   logging cancellation as a failure

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for discord-archive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for discord-archive
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "output_dir")
        key: Option<String>,
    },

    /// Discord API error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Recoverable per-channel export condition
    #[error("export error: {0}")]
    Export(#[from] ExportError),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation was cancelled via the session cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Error observed through a coalesced in-flight request shared by
    /// multiple waiters (see `MemberCache`)
    #[error(transparent)]
    Coalesced(#[from] Arc<Error>),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the remote API client collaborator
#[derive(Debug, Error)]
pub enum ApiError {
    /// Authentication token was rejected
    #[error("authentication failed: the provided token is invalid")]
    Unauthorized,

    /// The token lacks access to the requested resource
    #[error("access forbidden: {resource}")]
    Forbidden {
        /// Description of the resource that could not be accessed
        resource: String,
    },

    /// The requested entity does not exist (or is not visible to the token)
    #[error("not found: {resource}")]
    NotFound {
        /// Description of the entity that was not found
        resource: String,
    },

    /// Any other HTTP-level failure, carrying the status code
    #[error("request failed with status {status}: {message}")]
    Status {
        /// HTTP status code returned by the remote service
        status: u16,
        /// Response body or reason phrase, when available
        message: String,
    },
}

/// Recoverable per-channel export conditions
///
/// These are caught at the orchestrator boundary and recorded against the
/// failing channel's label instead of aborting sibling exports.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Channel contains no messages at all
    #[error("channel {channel} does not contain any messages")]
    EmptyChannel {
        /// Label of the empty channel
        channel: String,
    },

    /// Channel has messages, but none within the requested time range
    #[error("channel {channel} does not contain messages within the requested period")]
    NoMessagesInRange {
        /// Label of the channel
        channel: String,
    },

    /// The token cannot read the channel's history
    #[error("access to channel {channel} is forbidden")]
    AccessDenied {
        /// Label of the inaccessible channel
        channel: String,
    },
}

impl Error {
    /// Returns true for per-item conditions the orchestrator records against
    /// the failing channel instead of aborting the batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Export(_))
    }

    /// Returns true if this error originates from the session cancellation
    /// token, including when observed through a coalesced in-flight request.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Coalesced(inner) => inner.is_cancellation(),
            _ => false,
        }
    }
}
