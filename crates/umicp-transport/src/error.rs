//! Transport error aliases over the unified UMICP error system.

pub use umicp_core::{UmicpError, UmicpResult};

/// Type alias for transport errors.
pub type TransportError = UmicpError;

/// Result alias used by transport operations.
pub type TransportResult<T> = UmicpResult<T>;
