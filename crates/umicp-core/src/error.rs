//! Unified error type for UMICP operations.
//!
//! A single error enum with constructor helpers replaces a per-module
//! exception hierarchy. Pool exhaustion is deliberately absent: an acquire
//! that runs out the clock is reported as `Ok(None)`, not an error.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the workspace.
pub type UmicpResult<T> = Result<T, UmicpError>;

/// Unified error type for all UMICP transport operations.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum UmicpError {
    /// Connection could not be established (reconnect attempts exhausted)
    #[error("connect failed: {message}")]
    ConnectFailed {
        /// What went wrong while connecting
        message: String,
    },

    /// A write on an open channel failed or the channel was closed
    #[error("send failed: {message}")]
    SendFailed {
        /// What went wrong while sending
        message: String,
    },

    /// A deadline elapsed (request-response wait or similar)
    #[error("timeout: {message}")]
    Timeout {
        /// Which operation timed out
        message: String,
    },

    /// Operation attempted on a pool that has been shut down
    #[error("pool closed: {message}")]
    PoolClosed {
        /// Which operation hit the closed pool
        message: String,
    },

    /// Malformed envelope or failed encode/decode
    #[error("serialization error: {message}")]
    Serialization {
        /// What failed to round-trip
        message: String,
    },

    /// Peer link used before the hello/ack exchange finished.
    /// Part of the taxonomy; not raised by any current code path.
    #[error("handshake incomplete: {message}")]
    HandshakeIncomplete {
        /// Which peer link was not ready
        message: String,
    },

    /// Invalid input or configuration
    #[error("invalid: {message}")]
    Invalid {
        /// What was invalid
        message: String,
    },

    /// Underlying socket or I/O failure
    #[error("io error: {message}")]
    Io {
        /// The underlying failure
        message: String,
    },
}

impl UmicpError {
    /// Create a connect-failed error
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
        }
    }

    /// Create a send-failed error
    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a pool-closed error
    pub fn pool_closed(message: impl Into<String>) -> Self {
        Self::PoolClosed {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a handshake-incomplete error
    pub fn handshake_incomplete(message: impl Into<String>) -> Self {
        Self::HandshakeIncomplete {
            message: message.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// True if this error represents a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for UmicpError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}
