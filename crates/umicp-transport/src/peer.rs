//! Multiplexed peer: one identity over many links.
//!
//! A [`MultiplexedPeer`] can accept connections through an embedded
//! [`ChannelServer`] and dial out through [`TransportChannel`]s at the same
//! time. Every link lands in one registry keyed by a peer id, and inbound
//! envelopes are dispatched by operation kind after the hello handshake
//! establishes the remote identity.
//!
//! The handshake is asymmetric: only the dialing side announces itself with
//! a control envelope carrying `action=hello`. The accepting side replies
//! with `action=handshake_complete`, after which both registries hold a
//! [`PeerInfo`] for the remote and both sides emit
//! [`PeerEvent::PeerReady`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};
use umicp_core::{Envelope, Event, EventBus, ListenerId, OperationType, UmicpError};

use crate::channel::{ChannelEvent, ChannelEventKind, TransportChannel};
use crate::config::{ChannelConfig, PeerConfig, ServerConfig};
use crate::error::TransportResult;
use crate::server::{ChannelServer, ClientId, ClientInfo, ServerEvent, ServerEventKind};
use crate::sync::locked;

const ACTION_HELLO: &str = "hello";
const ACTION_HANDSHAKE_COMPLETE: &str = "handshake_complete";
const META_PREFIX: &str = "meta_";
const PROTOCOL_VERSION: &str = "1.0";

/// Direction of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// The remote dialed us through the embedded server
    Incoming,
    /// We dialed the remote
    Outgoing,
}

/// Remote identity learned from the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer id the remote declared
    pub peer_id: String,
    /// Metadata the remote attached to its handshake
    pub metadata: BTreeMap<String, String>,
    /// Raw capability map of the handshake envelope
    pub capabilities: BTreeMap<String, String>,
    /// When the handshake completed locally
    pub completed_at: Instant,
}

impl PeerInfo {
    fn from_envelope(envelope: &Envelope) -> Self {
        let peer_id = envelope
            .capability("peerId")
            .unwrap_or(&envelope.from)
            .to_string();
        let metadata = envelope
            .capabilities
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(META_PREFIX)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect();
        Self {
            peer_id,
            metadata,
            capabilities: envelope.capabilities.clone(),
            completed_at: Instant::now(),
        }
    }
}

/// Snapshot of one registered link, attached to peer events.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Registry id, unique within the owning [`MultiplexedPeer`]
    pub id: String,
    /// Link direction
    pub kind: PeerKind,
    /// Dialed endpoint, outgoing links only
    pub remote_url: Option<String>,
    /// Application metadata for this link
    pub metadata: BTreeMap<String, String>,
    /// Whether the handshake has completed
    pub handshake_complete: bool,
    /// Remote identity, present once the handshake completes
    pub info: Option<PeerInfo>,
    /// When the link was registered
    pub connected_at: Instant,
}

/// Events emitted by a [`MultiplexedPeer`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A link was registered (handshake may still be pending)
    PeerConnect(PeerConnection),
    /// The handshake on a link completed
    PeerReady {
        /// The link, with `info` populated
        peer: PeerConnection,
        /// Remote identity
        info: PeerInfo,
    },
    /// A link dropped and left the registry
    PeerDisconnect(PeerConnection),
    /// Any non-handshake envelope, emitted before its kind-specific event
    Message {
        /// The envelope
        envelope: Envelope,
        /// The link it arrived on
        peer: PeerConnection,
    },
    /// A data envelope
    Data {
        /// The envelope
        envelope: Envelope,
        /// The link it arrived on
        peer: PeerConnection,
    },
    /// A non-handshake control envelope
    Control {
        /// The envelope
        envelope: Envelope,
        /// The link it arrived on
        peer: PeerConnection,
    },
    /// An acknowledgement envelope
    Ack {
        /// The envelope
        envelope: Envelope,
        /// The link it arrived on
        peer: PeerConnection,
    },
    /// An error envelope from the remote
    ErrorMessage {
        /// The envelope
        envelope: Envelope,
        /// The link it arrived on
        peer: PeerConnection,
    },
    /// The embedded server is listening
    ServerReady {
        /// Bound address
        addr: std::net::SocketAddr,
    },
    /// A raw client socket was accepted by the embedded server
    ClientConnected(ClientInfo),
    /// A raw client socket closed
    ClientDisconnected(ClientInfo),
    /// A local failure tied to this peer, never fatal to the peer itself
    Error {
        /// Description of the failure
        message: String,
        /// The link involved, if any
        peer_id: Option<String>,
    },
}

/// Kind discriminant for [`PeerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    /// See [`PeerEvent::PeerConnect`]
    PeerConnect,
    /// See [`PeerEvent::PeerReady`]
    PeerReady,
    /// See [`PeerEvent::PeerDisconnect`]
    PeerDisconnect,
    /// See [`PeerEvent::Message`]
    Message,
    /// See [`PeerEvent::Data`]
    Data,
    /// See [`PeerEvent::Control`]
    Control,
    /// See [`PeerEvent::Ack`]
    Ack,
    /// See [`PeerEvent::ErrorMessage`]
    ErrorMessage,
    /// See [`PeerEvent::ServerReady`]
    ServerReady,
    /// See [`PeerEvent::ClientConnected`]
    ClientConnected,
    /// See [`PeerEvent::ClientDisconnected`]
    ClientDisconnected,
    /// See [`PeerEvent::Error`]
    Error,
}

impl Event for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            Self::PeerConnect(_) => PeerEventKind::PeerConnect,
            Self::PeerReady { .. } => PeerEventKind::PeerReady,
            Self::PeerDisconnect(_) => PeerEventKind::PeerDisconnect,
            Self::Message { .. } => PeerEventKind::Message,
            Self::Data { .. } => PeerEventKind::Data,
            Self::Control { .. } => PeerEventKind::Control,
            Self::Ack { .. } => PeerEventKind::Ack,
            Self::ErrorMessage { .. } => PeerEventKind::ErrorMessage,
            Self::ServerReady { .. } => PeerEventKind::ServerReady,
            Self::ClientConnected(_) => PeerEventKind::ClientConnected,
            Self::ClientDisconnected(_) => PeerEventKind::ClientDisconnected,
            Self::Error { .. } => PeerEventKind::Error,
        }
    }
}

/// Aggregate peer counters.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Local peer id
    pub peer_id: String,
    /// Registered links
    pub connected_peers: usize,
    /// Links we dialed
    pub outgoing_peers: usize,
    /// Links dialed to us
    pub incoming_peers: usize,
    /// Links past the handshake
    pub ready_peers: usize,
    /// Whether the embedded server is running
    pub server_running: bool,
    /// Envelopes routed out through any link
    pub messages_sent: u64,
    /// Envelopes received over any link
    pub messages_received: u64,
}

#[derive(Clone)]
enum PeerLink {
    Outgoing(TransportChannel),
    Incoming(ClientId),
}

struct PeerEntry {
    kind: PeerKind,
    remote_url: Option<String>,
    metadata: BTreeMap<String, String>,
    handshake_complete: bool,
    info: Option<PeerInfo>,
    connected_at: Instant,
    link: PeerLink,
    listeners: Vec<ListenerId>,
}

impl PeerEntry {
    fn snapshot(&self, id: &str) -> PeerConnection {
        PeerConnection {
            id: id.to_string(),
            kind: self.kind,
            remote_url: self.remote_url.clone(),
            metadata: self.metadata.clone(),
            handshake_complete: self.handshake_complete,
            info: self.info.clone(),
            connected_at: self.connected_at,
        }
    }
}

struct PeerShared {
    peer_id: String,
    metadata: BTreeMap<String, String>,
    config: PeerConfig,
    events: EventBus<PeerEvent>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    client_index: Mutex<HashMap<ClientId, String>>,
    server: Mutex<Option<ChannelServer>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// One local identity multiplexed over incoming and outgoing links.
#[derive(Clone)]
pub struct MultiplexedPeer {
    shared: Arc<PeerShared>,
}

impl MultiplexedPeer {
    /// Create a peer with the given identity and handshake metadata.
    pub fn new(
        peer_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
        config: PeerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PeerShared {
                peer_id: peer_id.into(),
                metadata,
                config,
                events: EventBus::new(),
                peers: Mutex::new(HashMap::new()),
                client_index: Mutex::new(HashMap::new()),
                server: Mutex::new(None),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
            }),
        }
    }

    /// Local peer id.
    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Start accepting inbound links on the given bind configuration.
    /// Returns the bound address.
    pub async fn start_server(&self, config: ServerConfig) -> TransportResult<std::net::SocketAddr> {
        if locked(&self.shared.server).is_some() {
            return Err(UmicpError::invalid("peer server already started"));
        }

        let server = ChannelServer::new(config);
        let weak = Arc::downgrade(&self.shared);
        {
            let weak = weak.clone();
            server.on(ServerEventKind::ClientConnected, move |event| {
                if let (Some(shared), ServerEvent::ClientConnected(client)) =
                    (weak.upgrade(), event)
                {
                    shared.on_client_connected(client);
                }
            });
        }
        {
            let weak = weak.clone();
            server.on(ServerEventKind::Message, move |event| {
                if let (Some(shared), ServerEvent::Message { envelope, client }) =
                    (weak.upgrade(), event)
                {
                    shared.on_client_message(client.id, envelope);
                }
            });
        }
        {
            let weak = weak.clone();
            server.on(ServerEventKind::ClientDisconnected, move |event| {
                if let (Some(shared), ServerEvent::ClientDisconnected { client, .. }) =
                    (weak.upgrade(), event)
                {
                    shared.on_client_disconnected(client);
                }
            });
        }
        {
            let weak = weak.clone();
            server.on(ServerEventKind::Error, move |event| {
                if let (Some(shared), ServerEvent::Error { message, client }) =
                    (weak.upgrade(), event)
                {
                    let peer_id = client
                        .as_ref()
                        .and_then(|client| shared.peer_id_for_client(client.id));
                    shared.emit_error(message.clone(), peer_id);
                }
            });
        }

        *locked(&self.shared.server) = Some(server.clone());
        let addr = match server.start().await {
            Ok(addr) => addr,
            Err(err) => {
                *locked(&self.shared.server) = None;
                return Err(err);
            }
        };

        info!(peer = %self.shared.peer_id, %addr, "peer server ready");
        self.shared.events.emit(&PeerEvent::ServerReady { addr });
        Ok(addr)
    }

    /// Dial a remote peer. Registers an outgoing link and, with
    /// `auto_protocol` set, announces the local identity once connected.
    /// Returns the registry id of the new link.
    pub async fn connect_to_peer(&self, url: impl Into<String>) -> TransportResult<String> {
        self.connect_to_peer_with_metadata(url, BTreeMap::new())
            .await
    }

    /// [`connect_to_peer`](Self::connect_to_peer) with application
    /// metadata attached to the new link.
    pub async fn connect_to_peer_with_metadata(
        &self,
        url: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> TransportResult<String> {
        let url = url.into();
        let peer_id = format!("outgoing-{}", uuid::Uuid::new_v4());
        let channel = TransportChannel::new(ChannelConfig::new(url.clone()));

        let weak = Arc::downgrade(&self.shared);
        let mut listeners = Vec::new();
        {
            let weak = weak.clone();
            let id = peer_id.clone();
            // Weak capture: a strong handle here would tie the channel's
            // lifetime to its own listener list.
            let handle = channel.downgrade();
            listeners.push(channel.on(ChannelEventKind::Connected, move |_| {
                if let (Some(shared), Some(channel)) = (weak.upgrade(), handle.upgrade()) {
                    shared.on_outgoing_connected(&id, &channel);
                }
            }));
        }
        {
            let weak = weak.clone();
            let id = peer_id.clone();
            listeners.push(channel.on(ChannelEventKind::Message, move |event| {
                if let (Some(shared), ChannelEvent::Message(envelope)) = (weak.upgrade(), event) {
                    shared.handle_envelope(&id, envelope);
                }
            }));
        }
        {
            let weak = weak.clone();
            let id = peer_id.clone();
            listeners.push(channel.on(ChannelEventKind::Disconnected, move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_outgoing_disconnected(&id);
                }
            }));
        }
        {
            let weak = weak.clone();
            let id = peer_id.clone();
            listeners.push(channel.on(ChannelEventKind::Error, move |event| {
                if let (Some(shared), ChannelEvent::Error { message }) = (weak.upgrade(), event) {
                    shared.emit_error(message.clone(), Some(id.clone()));
                }
            }));
        }

        // Registered before connecting so the connected callback finds it.
        {
            let mut peers = locked(&self.shared.peers);
            peers.insert(
                peer_id.clone(),
                PeerEntry {
                    kind: PeerKind::Outgoing,
                    remote_url: Some(url),
                    metadata,
                    handshake_complete: false,
                    info: None,
                    connected_at: Instant::now(),
                    link: PeerLink::Outgoing(channel.clone()),
                    listeners,
                },
            );
        }

        if let Err(err) = channel.connect().await {
            self.shared.drop_entry(&peer_id);
            return Err(err);
        }
        Ok(peer_id)
    }

    /// Route one envelope to one link. False on unknown id or transport
    /// failure, with an [`PeerEvent::Error`] surfaced instead of an `Err`.
    pub fn send_to_peer(&self, peer_id: &str, envelope: &Envelope) -> bool {
        self.shared.send_to_peer(peer_id, envelope, true)
    }

    /// Fan an envelope out to every link, optionally excluding one id.
    /// Returns the number of links it reached.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        let ids: Vec<String> = {
            let peers = locked(&self.shared.peers);
            peers
                .keys()
                .filter(|id| exclude != Some(id.as_str()))
                .cloned()
                .collect()
        };
        ids.iter()
            .filter(|id| self.shared.send_to_peer(id, envelope, false))
            .count()
    }

    /// Fan an envelope out to every link of one direction, optionally
    /// excluding one id. Returns the number of links it reached.
    pub fn broadcast_to_kind(
        &self,
        kind: PeerKind,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) -> usize {
        let ids: Vec<String> = {
            let peers = locked(&self.shared.peers);
            peers
                .iter()
                .filter(|(id, entry)| entry.kind == kind && exclude != Some(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect()
        };
        ids.iter()
            .filter(|id| self.shared.send_to_peer(id, envelope, false))
            .count()
    }

    /// Drop one link and remove it from the registry. False on unknown id.
    pub fn disconnect_peer(&self, peer_id: &str) -> bool {
        self.shared.drop_entry(peer_id)
    }

    /// Attach or overwrite one metadata entry on a link. False on unknown
    /// id.
    pub fn set_peer_metadata(
        &self,
        peer_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        let mut peers = locked(&self.shared.peers);
        match peers.get_mut(peer_id) {
            Some(entry) => {
                entry.metadata.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    /// Snapshot of one link.
    pub fn peer(&self, peer_id: &str) -> Option<PeerConnection> {
        locked(&self.shared.peers)
            .get(peer_id)
            .map(|entry| entry.snapshot(peer_id))
    }

    /// Snapshot of every registered link.
    pub fn peers(&self) -> Vec<PeerConnection> {
        locked(&self.shared.peers)
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect()
    }

    /// Snapshot of every link of one direction.
    pub fn peers_by_kind(&self, kind: PeerKind) -> Vec<PeerConnection> {
        locked(&self.shared.peers)
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, entry)| entry.snapshot(id))
            .collect()
    }

    /// First link whose metadata carries the given key/value pair.
    pub fn find_peer_by_metadata(&self, key: &str, value: &str) -> Option<PeerConnection> {
        locked(&self.shared.peers)
            .iter()
            .find(|(_, entry)| entry.metadata.get(key).is_some_and(|have| have == value))
            .map(|(id, entry)| entry.snapshot(id))
    }

    /// Number of registered links.
    pub fn peer_count(&self) -> usize {
        locked(&self.shared.peers).len()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> PeerStats {
        let (connected, outgoing, ready) = {
            let peers = locked(&self.shared.peers);
            let outgoing = peers
                .values()
                .filter(|entry| entry.kind == PeerKind::Outgoing)
                .count();
            let ready = peers
                .values()
                .filter(|entry| entry.handshake_complete)
                .count();
            (peers.len(), outgoing, ready)
        };
        PeerStats {
            peer_id: self.shared.peer_id.clone(),
            connected_peers: connected,
            outgoing_peers: outgoing,
            incoming_peers: connected - outgoing,
            ready_peers: ready,
            server_running: locked(&self.shared.server)
                .as_ref()
                .is_some_and(ChannelServer::is_running),
            messages_sent: self.shared.messages_sent.load(Ordering::SeqCst),
            messages_received: self.shared.messages_received.load(Ordering::SeqCst),
        }
    }

    /// Disconnect every link, clear the registry, and stop the embedded
    /// server. Resolves once fully stopped; idempotent.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = locked(&self.shared.peers).keys().cloned().collect();
        for id in ids {
            self.shared.drop_entry(&id);
        }
        locked(&self.shared.client_index).clear();

        let server = locked(&self.shared.server).take();
        if let Some(server) = server {
            server.stop().await;
        }
        info!(peer = %self.shared.peer_id, "peer shut down");
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: PeerEventKind, callback: F) -> ListenerId
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, callback)
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, kind: PeerEventKind, callback: F) -> ListenerId
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(kind, callback)
    }

    /// Deregister a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }
}

impl PeerShared {
    fn handshake_envelope(&self, action: &str) -> Envelope {
        let mut envelope = Envelope::new(&self.peer_id, "*", OperationType::Control)
            .with_capability("action", action)
            .with_capability("peerId", &self.peer_id)
            .with_capability("version", PROTOCOL_VERSION);
        for (key, value) in &self.metadata {
            envelope.set_capability(format!("{META_PREFIX}{key}"), value);
        }
        envelope
    }

    fn on_outgoing_connected(&self, peer_id: &str, channel: &TransportChannel) {
        let snapshot = {
            let peers = locked(&self.peers);
            match peers.get(peer_id) {
                Some(entry) => entry.snapshot(peer_id),
                None => return,
            }
        };

        debug!(peer = %peer_id, "outgoing link up");
        self.events.emit(&PeerEvent::PeerConnect(snapshot));
        if self.config.auto_protocol && !channel.send(&self.handshake_envelope(ACTION_HELLO)) {
            self.emit_error("hello send failed".to_string(), Some(peer_id.to_string()));
        }
    }

    // A link whose channel keeps reconnecting stays registered; its
    // handshake state resets and the connected callback redoes the hello.
    fn on_outgoing_disconnected(&self, peer_id: &str) {
        let (snapshot, removed) = {
            let mut peers = locked(&self.peers);
            let Some(entry) = peers.get_mut(peer_id) else {
                return;
            };
            let reconnecting = match &entry.link {
                PeerLink::Outgoing(channel) => channel.config().auto_reconnect,
                PeerLink::Incoming(_) => false,
            };
            entry.handshake_complete = false;
            entry.info = None;
            let snapshot = entry.snapshot(peer_id);
            let removed = if reconnecting {
                None
            } else {
                peers.remove(peer_id)
            };
            (snapshot, removed)
        };

        // The listeners hold channel handles; detaching them lets a
        // channel that will not reconnect free itself.
        if let Some(entry) = removed {
            if let PeerLink::Outgoing(channel) = entry.link {
                for listener in entry.listeners {
                    channel.off(listener);
                }
            }
        }

        debug!(peer = %peer_id, "outgoing link down");
        self.events.emit(&PeerEvent::PeerDisconnect(snapshot));
    }

    fn on_client_connected(&self, client: &ClientInfo) {
        let peer_id = format!("incoming-{}", client.id);
        let snapshot = {
            let mut peers = locked(&self.peers);
            let entry = PeerEntry {
                kind: PeerKind::Incoming,
                remote_url: None,
                metadata: BTreeMap::new(),
                handshake_complete: false,
                info: None,
                connected_at: Instant::now(),
                link: PeerLink::Incoming(client.id),
                listeners: Vec::new(),
            };
            let snapshot = entry.snapshot(&peer_id);
            peers.insert(peer_id.clone(), entry);
            snapshot
        };
        locked(&self.client_index).insert(client.id, peer_id.clone());

        debug!(peer = %peer_id, "incoming link up");
        self.events.emit(&PeerEvent::ClientConnected(client.clone()));
        self.events.emit(&PeerEvent::PeerConnect(snapshot));
    }

    fn on_client_message(&self, client: ClientId, envelope: &Envelope) {
        if let Some(peer_id) = self.peer_id_for_client(client) {
            self.handle_envelope(&peer_id, envelope);
        }
    }

    fn on_client_disconnected(&self, client: &ClientInfo) {
        let peer_id = locked(&self.client_index).remove(&client.id);
        let Some(peer_id) = peer_id else {
            return;
        };
        let snapshot = {
            let mut peers = locked(&self.peers);
            peers.remove(&peer_id).map(|entry| entry.snapshot(&peer_id))
        };

        self.events
            .emit(&PeerEvent::ClientDisconnected(client.clone()));
        if let Some(snapshot) = snapshot {
            debug!(peer = %peer_id, "incoming link down");
            self.events.emit(&PeerEvent::PeerDisconnect(snapshot));
        }
    }

    fn peer_id_for_client(&self, client: ClientId) -> Option<String> {
        locked(&self.client_index).get(&client).cloned()
    }

    fn handle_envelope(&self, peer_id: &str, envelope: &Envelope) {
        self.messages_received.fetch_add(1, Ordering::SeqCst);

        if envelope.operation.is_control() {
            match envelope.capability("action") {
                Some(ACTION_HELLO) => return self.on_handshake(peer_id, envelope, true),
                Some(ACTION_HANDSHAKE_COMPLETE) => {
                    return self.on_handshake(peer_id, envelope, false)
                }
                _ => {}
            }
        }

        let Some(peer) = self.snapshot(peer_id) else {
            return;
        };
        self.events.emit(&PeerEvent::Message {
            envelope: envelope.clone(),
            peer: peer.clone(),
        });
        let envelope = envelope.clone();
        let specific = match envelope.operation {
            OperationType::Data => PeerEvent::Data { envelope, peer },
            OperationType::Control => PeerEvent::Control { envelope, peer },
            OperationType::Ack => PeerEvent::Ack { envelope, peer },
            OperationType::Error => PeerEvent::ErrorMessage { envelope, peer },
            OperationType::Request | OperationType::Response => return,
        };
        self.events.emit(&specific);
    }

    fn on_handshake(&self, peer_id: &str, envelope: &Envelope, reply: bool) {
        let info = PeerInfo::from_envelope(envelope);
        let snapshot = {
            let mut peers = locked(&self.peers);
            let Some(entry) = peers.get_mut(peer_id) else {
                return;
            };
            entry.handshake_complete = true;
            entry.info = Some(info.clone());
            entry.snapshot(peer_id)
        };

        if reply {
            let ack = self.handshake_envelope(ACTION_HANDSHAKE_COMPLETE);
            if !self.send_to_peer(peer_id, &ack, false) {
                warn!(peer = %peer_id, "handshake reply failed");
            }
        }

        info!(peer = %peer_id, remote = %info.peer_id, "peer ready");
        self.events.emit(&PeerEvent::PeerReady {
            peer: snapshot,
            info,
        });
    }

    fn send_to_peer(&self, peer_id: &str, envelope: &Envelope, report: bool) -> bool {
        let link = {
            let peers = locked(&self.peers);
            peers.get(peer_id).map(|entry| entry.link.clone())
        };

        let sent = match link {
            Some(PeerLink::Outgoing(channel)) => channel.send(envelope),
            Some(PeerLink::Incoming(client)) => {
                let server = locked(&self.server).clone();
                match server {
                    Some(server) => server.send_to_client(client, envelope),
                    None => false,
                }
            }
            None => false,
        };

        if sent {
            self.messages_sent.fetch_add(1, Ordering::SeqCst);
        } else if report {
            self.emit_error(
                format!("send to peer {peer_id} failed"),
                Some(peer_id.to_string()),
            );
        }
        sent
    }

    // Removal without a disconnect event; deliberate teardown is not a
    // peer failure.
    fn drop_entry(&self, peer_id: &str) -> bool {
        let entry = locked(&self.peers).remove(peer_id);
        let Some(entry) = entry else {
            return false;
        };

        match entry.link {
            PeerLink::Outgoing(channel) => {
                for listener in entry.listeners {
                    channel.off(listener);
                }
                channel.disconnect();
            }
            PeerLink::Incoming(client) => {
                locked(&self.client_index).remove(&client);
                let server = locked(&self.server).clone();
                if let Some(server) = server {
                    server.disconnect_client(client);
                }
            }
        }
        debug!(peer = %peer_id, "peer removed");
        true
    }

    fn snapshot(&self, peer_id: &str) -> Option<PeerConnection> {
        locked(&self.peers)
            .get(peer_id)
            .map(|entry| entry.snapshot(peer_id))
    }

    fn emit_error(&self, message: String, peer_id: Option<String>) {
        warn!(peer = ?peer_id, %message, "peer error");
        self.events.emit(&PeerEvent::Error { message, peer_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn hello_flattens_metadata_into_capabilities() {
        let peer = MultiplexedPeer::new(
            "node-a",
            meta(&[("role", "worker"), ("zone", "eu")]),
            PeerConfig::default(),
        );
        let hello = peer.shared.handshake_envelope(ACTION_HELLO);

        assert_eq!(hello.operation, OperationType::Control);
        assert_eq!(hello.capability("action"), Some(ACTION_HELLO));
        assert_eq!(hello.capability("peerId"), Some("node-a"));
        assert_eq!(hello.capability("version"), Some(PROTOCOL_VERSION));
        assert_eq!(hello.capability("meta_role"), Some("worker"));
        assert_eq!(hello.capability("meta_zone"), Some("eu"));
    }

    #[test]
    fn peer_info_recovers_metadata_from_prefixed_capabilities() {
        let peer = MultiplexedPeer::new("node-a", meta(&[("role", "x")]), PeerConfig::default());
        let hello = peer.shared.handshake_envelope(ACTION_HELLO);

        let info = PeerInfo::from_envelope(&hello);
        assert_eq!(info.peer_id, "node-a");
        assert_eq!(info.metadata, meta(&[("role", "x")]));
    }

    #[test]
    fn peer_info_falls_back_to_envelope_sender() {
        let envelope = Envelope::new("node-b", "*", OperationType::Control)
            .with_capability("action", ACTION_HELLO);
        let info = PeerInfo::from_envelope(&envelope);
        assert_eq!(info.peer_id, "node-b");
        assert!(info.metadata.is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_peer_surfaces_error_event() {
        let peer = MultiplexedPeer::new("node-a", BTreeMap::new(), PeerConfig::default());
        let errors = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&errors);
        peer.on(PeerEventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let envelope = Envelope::new("node-a", "node-b", OperationType::Data);
        assert!(!peer.send_to_peer("outgoing-missing", &envelope));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_unknown_peer_is_false() {
        let peer = MultiplexedPeer::new("node-a", BTreeMap::new(), PeerConfig::default());
        assert!(!peer.disconnect_peer("outgoing-missing"));
    }

    #[tokio::test]
    async fn broadcast_over_empty_registry_reaches_nobody() {
        let peer = MultiplexedPeer::new("node-a", BTreeMap::new(), PeerConfig::default());
        let envelope = Envelope::new("node-a", "*", OperationType::Data);
        assert_eq!(peer.broadcast(&envelope, None), 0);
        assert_eq!(peer.broadcast_to_kind(PeerKind::Outgoing, &envelope, None), 0);
    }

    #[tokio::test]
    async fn dropping_peer_releases_outgoing_channels() {
        let server = ChannelServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });
        let addr = server.start().await.unwrap();

        let peer = MultiplexedPeer::new("node-a", BTreeMap::new(), PeerConfig::default());
        let link = peer.connect_to_peer(format!("ws://{addr}")).await.unwrap();
        let weak = {
            let peers = locked(&peer.shared.peers);
            match &peers.get(&link).unwrap().link {
                PeerLink::Outgoing(channel) => channel.downgrade(),
                PeerLink::Incoming(_) => unreachable!("dialed link is outgoing"),
            }
        };
        assert!(weak.upgrade().is_some());

        // The registry entry holds the only strong handle; its listeners
        // must not hold another.
        drop(peer);
        assert!(weak.upgrade().is_none());

        server.stop().await;
    }
}
