//! Error types for DStore
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for DStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for DStore
#[derive(Debug, Error)]
pub enum Error {
    // I/O and storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk id: {0:?}")]
    InvalidChunkId(String),

    // Network/protocol errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unexpected status from peer: {0}")]
    UnexpectedStatus(String),

    // Startup errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::Io(_)
        )
    }

    /// Check if the peer sent something we could not understand
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::FrameTooLarge { .. }
                | Self::UnknownCommand(_)
                | Self::UnexpectedStatus(_)
        )
    }
}
