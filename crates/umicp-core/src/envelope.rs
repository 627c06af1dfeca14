//! UMICP envelope: the message unit exchanged between peers.
//!
//! An envelope carries addressing (`from`/`to`), an operation kind, a
//! unique message id, and a string-keyed capability map. The codec
//! contract is lossless round-trip; byte layout beyond that is owned by
//! the serializer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{UmicpError, UmicpResult};

/// Operation kind carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Protocol control message (handshake, liveness)
    Control,
    /// Application data
    Data,
    /// Acknowledgment
    Ack,
    /// Error report
    Error,
    /// Request expecting a correlated response
    Request,
    /// Response correlated to a request
    Response,
}

impl OperationType {
    /// True for [`OperationType::Control`]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control)
    }

    /// True for [`OperationType::Data`]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data)
    }

    /// True for [`OperationType::Ack`]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    /// True for [`OperationType::Error`]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// Message unit exchanged between peers.
///
/// Capabilities are an ordered string map; control envelopes use the
/// reserved keys `action`, `peerId`, and `meta_<key>` entries for the
/// handshake protocol, and `in_reply_to` for request-response
/// correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender identifier
    pub from: String,
    /// Recipient identifier
    pub to: String,
    /// Operation kind
    pub operation: OperationType,
    /// Unique message identifier
    pub message_id: String,
    /// String-keyed message metadata
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a freshly generated message id.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        operation: OperationType,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            operation,
            message_id: Uuid::new_v4().to_string(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Replace the generated message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Add a capability entry (builder form).
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    /// Look up a capability value.
    pub fn capability(&self, key: &str) -> Option<&str> {
        self.capabilities.get(key).map(String::as_str)
    }

    /// True if the capability key is present.
    pub fn has_capability(&self, key: &str) -> bool {
        self.capabilities.contains_key(key)
    }

    /// Insert or replace a capability entry.
    pub fn set_capability(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.capabilities.insert(key.into(), value.into());
    }

    /// Remove a capability entry, returning its value if present.
    pub fn remove_capability(&mut self, key: &str) -> Option<String> {
        self.capabilities.remove(key)
    }

    /// Check addressing is populated.
    pub fn validate(&self) -> UmicpResult<()> {
        if self.from.is_empty() {
            return Err(UmicpError::invalid("envelope 'from' must not be empty"));
        }
        if self.to.is_empty() {
            return Err(UmicpError::invalid("envelope 'to' must not be empty"));
        }
        Ok(())
    }

    /// Encode to the wire representation.
    pub fn serialize(&self) -> UmicpResult<String> {
        serde_json::to_string(self).map_err(|e| UmicpError::serialization(e.to_string()))
    }

    /// Decode from the wire representation.
    pub fn deserialize(raw: &str) -> UmicpResult<Self> {
        serde_json::from_str(raw).map_err(|e| UmicpError::serialization(e.to_string()))
    }
}
