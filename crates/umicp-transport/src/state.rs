//! Per-channel connection state and traffic counters.

use std::time::{Duration, Instant};

/// Traffic record for one channel, mutated only by its owning channel.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    connected: bool,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    connected_at: Option<Instant>,
    disconnected_at: Option<Instant>,
}

impl ConnectionState {
    /// Fresh disconnected state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the connected flag, stamping the transition time.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if connected {
            self.connected_at = Some(Instant::now());
            self.disconnected_at = None;
        } else {
            self.disconnected_at = Some(Instant::now());
        }
    }

    /// Current connected flag.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Record one outbound message of the given size.
    pub fn record_sent(&mut self, bytes: u64) {
        self.messages_sent += 1;
        self.bytes_sent += bytes;
    }

    /// Record one inbound message of the given size.
    pub fn record_received(&mut self, bytes: u64) {
        self.messages_received += 1;
        self.bytes_received += bytes;
    }

    /// Messages sent since construction or reset.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Messages received since construction or reset.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Bytes sent since construction or reset.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes received since construction or reset.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time connected, running while up and frozen after disconnect.
    pub fn uptime(&self) -> Option<Duration> {
        let connected_at = self.connected_at?;
        match self.disconnected_at {
            Some(disconnected_at) => Some(disconnected_at.saturating_duration_since(connected_at)),
            None => Some(connected_at.elapsed()),
        }
    }

    /// Zero every counter and flag.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time snapshot of one channel's state and queue depth.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    /// Configured endpoint
    pub url: String,
    /// Connected flag at snapshot time
    pub connected: bool,
    /// Reconnect attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Envelopes queued while disconnected
    pub pending_messages: usize,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Time connected, if a connection was ever established
    pub uptime: Option<Duration>,
}
