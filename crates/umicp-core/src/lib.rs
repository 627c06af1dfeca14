//! Core UMICP types shared by every transport component.
//!
//! This crate holds the leaf types the transport layer is built on: the
//! [`Envelope`] message unit and its operation kinds, the unified
//! [`UmicpError`] type, and the typed [`EventBus`] used for listener
//! registration across channels, servers, and peers.

pub mod envelope;
pub mod error;
pub mod events;

pub use envelope::{Envelope, OperationType};
pub use error::{UmicpError, UmicpResult};
pub use events::{Event, EventBus, ListenerId};
