//! Multiplexed peer transport and connection pooling for UMICP.
//!
//! A node built on this crate acts simultaneously as a connection acceptor
//! and a connection initiator toward many peers: [`TransportChannel`] is
//! one client-side duplex link with reconnect, heartbeat, and
//! request-response correlation; [`ChannelServer`] accepts many concurrent
//! sockets; [`MultiplexedPeer`] ties both together under one identity and
//! runs the hello/handshake_complete protocol; [`ConnectionPool`] reuses
//! costly connections to one address behind a bounded, validated pool.

pub mod channel;
pub mod config;
pub mod error;
pub mod peer;
pub mod pool;
pub mod server;
pub mod state;

mod sync;

pub use channel::{ChannelEvent, ChannelEventKind, TransportChannel};
pub use config::{ChannelConfig, PeerConfig, PoolConfig, ServerConfig};
pub use error::{TransportError, TransportResult};
pub use peer::{
    MultiplexedPeer, PeerConnection, PeerEvent, PeerEventKind, PeerInfo, PeerKind, PeerStats,
};
pub use pool::{
    ChannelConnector, ConnectionPool, Connector, PoolConnectionState, PoolStats, PooledConnection,
};
pub use server::{ChannelServer, ClientId, ClientInfo, ServerEvent, ServerEventKind, ServerStats};
pub use state::{ChannelStats, ConnectionState};
