//! Server-side channel: accepts many concurrent sockets.
//!
//! Each accepted socket gets an opaque [`ClientId`] and its own reader and
//! writer tasks. One misbehaving client surfaces as an error event and a
//! disconnect; the accept loop keeps running.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use umicp_core::{Envelope, Event, EventBus, ListenerId, UmicpError};

use crate::config::ServerConfig;
use crate::error::TransportResult;
use crate::sync::locked;

/// Opaque identifier for one accepted client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Snapshot of one connected client, attached to server events.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client identifier
    pub id: ClientId,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// When the socket was accepted
    pub connected_at: Instant,
    /// Envelopes sent to this client
    pub messages_sent: u64,
    /// Envelopes received from this client
    pub messages_received: u64,
}

/// Events emitted by a [`ChannelServer`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listener is bound and accepting
    Listening {
        /// Bound address (useful with port 0)
        addr: SocketAddr,
    },
    /// The server stopped accepting and closed every client
    Stopped,
    /// A client socket was accepted
    ClientConnected(ClientInfo),
    /// A client socket closed
    ClientDisconnected {
        /// The client that left
        client: ClientInfo,
        /// Close code, if the remote sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
    /// An envelope arrived from a client
    Message {
        /// The decoded envelope
        envelope: Envelope,
        /// Sending client
        client: ClientInfo,
    },
    /// A non-fatal failure, optionally tied to one client
    Error {
        /// Description of the failure
        message: String,
        /// The client involved, if any
        client: Option<ClientInfo>,
    },
}

/// Kind discriminant for [`ServerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    /// See [`ServerEvent::Listening`]
    Listening,
    /// See [`ServerEvent::Stopped`]
    Stopped,
    /// See [`ServerEvent::ClientConnected`]
    ClientConnected,
    /// See [`ServerEvent::ClientDisconnected`]
    ClientDisconnected,
    /// See [`ServerEvent::Message`]
    Message,
    /// See [`ServerEvent::Error`]
    Error,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Listening { .. } => ServerEventKind::Listening,
            Self::Stopped => ServerEventKind::Stopped,
            Self::ClientConnected(_) => ServerEventKind::ClientConnected,
            Self::ClientDisconnected { .. } => ServerEventKind::ClientDisconnected,
            Self::Message { .. } => ServerEventKind::Message,
            Self::Error { .. } => ServerEventKind::Error,
        }
    }
}

/// Aggregate server counters.
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Whether the accept loop is running
    pub running: bool,
    /// Clients currently connected
    pub connected_clients: usize,
    /// Sockets accepted over the server's lifetime
    pub total_connections: u64,
    /// Envelopes sent to clients
    pub messages_sent: u64,
    /// Envelopes received from clients
    pub messages_received: u64,
}

struct ClientEntry {
    sender: mpsc::UnboundedSender<WsMessage>,
    remote_addr: SocketAddr,
    connected_at: Instant,
    messages_sent: u64,
    messages_received: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientEntry {
    fn info(&self, id: ClientId) -> ClientInfo {
        ClientInfo {
            id,
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
        }
    }
}

struct ServerShared {
    config: ServerConfig,
    events: EventBus<ServerEvent>,
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Listening side of the transport: many concurrent client sockets under
/// one accept loop, each addressable by its [`ClientId`].
#[derive(Clone)]
pub struct ChannelServer {
    shared: Arc<ServerShared>,
}

impl ChannelServer {
    /// Create a server for the given bind configuration. Nothing listens
    /// until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                events: EventBus::new(),
                clients: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
                total_connections: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Bind and start accepting. Returns the bound address, which differs
    /// from the configured one when port 0 was requested.
    pub async fn start(&self) -> TransportResult<SocketAddr> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(UmicpError::invalid("server already running"));
        }

        let listener = TcpListener::bind(self.shared.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        *locked(&self.shared.local_addr) = Some(addr);

        info!(%addr, "server listening");
        self.shared.events.emit(&ServerEvent::Listening { addr });

        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let Some(shared) = weak.upgrade() else {
                            return;
                        };
                        let shared_weak = Arc::downgrade(&shared);
                        tokio::spawn(async move {
                            ServerShared::handle_socket(shared_weak, stream, remote_addr).await;
                        });
                    }
                    Err(err) => {
                        let Some(shared) = weak.upgrade() else {
                            return;
                        };
                        if !shared.running.load(Ordering::SeqCst) {
                            return;
                        }
                        shared.events.emit(&ServerEvent::Error {
                            message: format!("accept failed: {err}"),
                            client: None,
                        });
                    }
                }
            }
        });
        *locked(&self.shared.accept_task) = Some(task);

        Ok(addr)
    }

    /// Stop accepting and close every client socket. Resolves once the
    /// registry is clear; idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = locked(&self.shared.accept_task).take() {
            task.abort();
        }
        *locked(&self.shared.local_addr) = None;

        let entries: Vec<(ClientId, ClientEntry)> =
            locked(&self.shared.clients).drain().collect();
        for (id, entry) in entries {
            debug!(client = %id, "closing client on server stop");
            let _ = entry.sender.send(WsMessage::Close(None));
            entry.reader.abort();
            // Writer exits on its own after the close frame goes out.
            let _ = entry.writer;
        }

        info!("server stopped");
        self.shared.events.emit(&ServerEvent::Stopped);
    }

    /// Send one envelope to one client. False on unknown id, serialize
    /// failure, or a closed socket.
    pub fn send_to_client(&self, id: ClientId, envelope: &Envelope) -> bool {
        self.shared.send_to_client(id, envelope)
    }

    /// Fan an envelope out to every client, optionally excluding one.
    /// Returns the number of clients it reached.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<ClientId>) -> usize {
        let raw = match envelope.serialize() {
            Ok(raw) => raw,
            Err(err) => {
                self.shared.events.emit(&ServerEvent::Error {
                    message: err.to_string(),
                    client: None,
                });
                return 0;
            }
        };

        let mut sent = 0;
        {
            let mut clients = locked(&self.shared.clients);
            for (id, entry) in clients.iter_mut() {
                if exclude == Some(*id) {
                    continue;
                }
                if entry.sender.send(WsMessage::Text(raw.clone())).is_ok() {
                    entry.messages_sent += 1;
                    sent += 1;
                }
            }
        }
        self.shared
            .messages_sent
            .fetch_add(sent as u64, Ordering::SeqCst);
        sent
    }

    /// Close one client socket. False on unknown id; registry removal and
    /// the disconnect event follow when the socket actually closes.
    pub fn disconnect_client(&self, id: ClientId) -> bool {
        let clients = locked(&self.shared.clients);
        match clients.get(&id) {
            Some(entry) => entry.sender.send(WsMessage::Close(None)).is_ok(),
            None => false,
        }
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        locked(&self.shared.clients).len()
    }

    /// Snapshot of every connected client.
    pub fn clients(&self) -> Vec<ClientInfo> {
        locked(&self.shared.clients)
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *locked(&self.shared.local_addr)
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            running: self.is_running(),
            connected_clients: self.client_count(),
            total_connections: self.shared.total_connections.load(Ordering::SeqCst),
            messages_sent: self.shared.messages_sent.load(Ordering::SeqCst),
            messages_received: self.shared.messages_received.load(Ordering::SeqCst),
        }
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: ServerEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, callback)
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, kind: ServerEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(kind, callback)
    }

    /// Deregister a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }
}

impl ServerShared {
    async fn handle_socket(weak: Weak<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let max_payload = match weak.upgrade() {
            Some(shared) => shared.config.max_payload,
            None => return,
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(max_payload),
            ..WebSocketConfig::default()
        };
        let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws_stream) => ws_stream,
            Err(err) => {
                if let Some(shared) = weak.upgrade() {
                    shared.events.emit(&ServerEvent::Error {
                        message: format!("websocket accept failed: {err}"),
                        client: None,
                    });
                }
                return;
            }
        };

        let Some(shared) = weak.upgrade() else {
            return;
        };

        let id = ClientId::new();
        let (mut sink, mut stream) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let is_close = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() || is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_weak = Weak::clone(&weak);
        let reader_task = tokio::spawn(async move {
            let (code, reason) = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(raw))) => {
                        Self::on_client_message(&reader_weak, id, &raw)
                    }
                    Some(Ok(WsMessage::Binary(raw))) => match String::from_utf8(raw) {
                        Ok(text) => Self::on_client_message(&reader_weak, id, &text),
                        Err(_) => Self::emit_client_error(&reader_weak, id, "non-utf8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        Self::emit_client_error(&reader_weak, id, &format!("read failed: {err}"));
                        break (None, err.to_string());
                    }
                    None => break (None, "stream ended".to_string()),
                }
            };
            if let Some(shared) = reader_weak.upgrade() {
                shared.on_client_closed(id, code, reason);
            }
        });

        let info = {
            let mut clients = locked(&shared.clients);
            let entry = ClientEntry {
                sender: writer_tx,
                remote_addr,
                connected_at: Instant::now(),
                messages_sent: 0,
                messages_received: 0,
                reader: reader_task,
                writer: writer_task,
            };
            let info = entry.info(id);
            clients.insert(id, entry);
            info
        };
        shared.total_connections.fetch_add(1, Ordering::SeqCst);

        debug!(client = %id, %remote_addr, "client connected");
        shared.events.emit(&ServerEvent::ClientConnected(info));
    }

    fn on_client_message(weak: &Weak<Self>, id: ClientId, raw: &str) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match Envelope::deserialize(raw) {
            Ok(envelope) => {
                let info = {
                    let mut clients = locked(&shared.clients);
                    let Some(entry) = clients.get_mut(&id) else {
                        return;
                    };
                    entry.messages_received += 1;
                    entry.info(id)
                };
                shared.messages_received.fetch_add(1, Ordering::SeqCst);
                shared.events.emit(&ServerEvent::Message {
                    envelope,
                    client: info,
                });
            }
            Err(err) => Self::emit_client_error(weak, id, &err.to_string()),
        }
    }

    fn emit_client_error(weak: &Weak<Self>, id: ClientId, message: &str) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let info = locked(&shared.clients)
            .get(&id)
            .map(|entry| entry.info(id));
        warn!(client = %id, %message, "client error");
        shared.events.emit(&ServerEvent::Error {
            message: message.to_string(),
            client: info,
        });
    }

    fn on_client_closed(&self, id: ClientId, code: Option<u16>, reason: String) {
        let removed = {
            let mut clients = locked(&self.clients);
            clients.remove(&id).map(|entry| entry.info(id))
        };
        if let Some(client) = removed {
            debug!(client = %id, ?code, %reason, "client disconnected");
            self.events.emit(&ServerEvent::ClientDisconnected {
                client,
                code,
                reason,
            });
        }
    }

    fn send_to_client(&self, id: ClientId, envelope: &Envelope) -> bool {
        let raw = match envelope.serialize() {
            Ok(raw) => raw,
            Err(err) => {
                self.events.emit(&ServerEvent::Error {
                    message: err.to_string(),
                    client: None,
                });
                return false;
            }
        };

        let sent = {
            let mut clients = locked(&self.clients);
            match clients.get_mut(&id) {
                Some(entry) => {
                    if entry.sender.send(WsMessage::Text(raw)).is_ok() {
                        entry.messages_sent += 1;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if sent {
            self.messages_sent.fetch_add(1, Ordering::SeqCst);
        }
        sent
    }
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let clients = self.clients.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in clients.values() {
            entry.reader.abort();
            entry.writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = ChannelServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });

        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = ChannelServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });

        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn bound_address_reflects_ephemeral_port() {
        let server = ChannelServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.stop().await;
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_false() {
        let server = ChannelServer::new(ServerConfig::default());
        let envelope = Envelope::new("a", "b", umicp_core::OperationType::Data);
        assert!(!server.send_to_client(ClientId::new(), &envelope));
    }
}
