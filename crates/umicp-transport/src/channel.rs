//! Client-side transport channel.
//!
//! One [`TransportChannel`] owns one WebSocket connection: a writer task
//! drains an unbounded queue (the socket's sole writer, so sends stay
//! FIFO), a reader task dispatches inbound envelopes, and a heartbeat
//! task emits periodic liveness pings. Reconnection retries with a fixed
//! delay up to a configured attempt limit; envelopes sent while
//! disconnected are queued and flushed in order once the link returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use umicp_core::{Envelope, Event, EventBus, ListenerId, UmicpError};

use crate::config::ChannelConfig;
use crate::error::TransportResult;
use crate::state::{ChannelStats, ConnectionState};
use crate::sync::locked;

/// Events emitted by a [`TransportChannel`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A connection attempt is starting
    Connecting,
    /// The channel is open
    Connected,
    /// The channel closed, locally or remotely
    Disconnected {
        /// Close code reported by the remote, if any
        code: Option<u16>,
        /// Close reason, if any
        reason: String,
    },
    /// A non-fatal transport failure
    Error {
        /// Description of the failure
        message: String,
    },
    /// A reconnect attempt is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Configured attempt limit
        max: u32,
    },
    /// Queued-while-disconnected envelopes went out after a reconnect
    MessagesFlushed {
        /// How many envelopes were delivered
        count: usize,
    },
    /// An inbound envelope arrived
    Message(Envelope),
}

/// Kind discriminant for [`ChannelEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    /// See [`ChannelEvent::Connecting`]
    Connecting,
    /// See [`ChannelEvent::Connected`]
    Connected,
    /// See [`ChannelEvent::Disconnected`]
    Disconnected,
    /// See [`ChannelEvent::Error`]
    Error,
    /// See [`ChannelEvent::Reconnecting`]
    Reconnecting,
    /// See [`ChannelEvent::MessagesFlushed`]
    MessagesFlushed,
    /// See [`ChannelEvent::Message`]
    Message,
}

impl Event for ChannelEvent {
    type Kind = ChannelEventKind;

    fn kind(&self) -> ChannelEventKind {
        match self {
            Self::Connecting => ChannelEventKind::Connecting,
            Self::Connected => ChannelEventKind::Connected,
            Self::Disconnected { .. } => ChannelEventKind::Disconnected,
            Self::Error { .. } => ChannelEventKind::Error,
            Self::Reconnecting { .. } => ChannelEventKind::Reconnecting,
            Self::MessagesFlushed { .. } => ChannelEventKind::MessagesFlushed,
            Self::Message(_) => ChannelEventKind::Message,
        }
    }
}

#[derive(Default)]
struct ChannelTasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct ChannelShared {
    config: ChannelConfig,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    state: Mutex<ConnectionState>,
    pending: Mutex<VecDeque<Envelope>>,
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    tasks: Mutex<ChannelTasks>,
    events: EventBus<ChannelEvent>,
}

/// One client-side duplex connection with reconnect, heartbeat, queueing,
/// and request-response correlation.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<ChannelShared>,
}

impl TransportChannel {
    /// Create a channel for the configured endpoint. Nothing connects
    /// until [`connect`](Self::connect) is called.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                reconnecting: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                state: Mutex::new(ConnectionState::new()),
                pending: Mutex::new(VecDeque::new()),
                writer: Mutex::new(None),
                tasks: Mutex::new(ChannelTasks::default()),
                events: EventBus::new(),
                config,
            }),
        }
    }

    /// Connect, retrying with the fixed delay up to the configured attempt
    /// limit when auto-reconnect is enabled. Resolves once the socket is
    /// open and any queued envelopes have been flushed.
    pub async fn connect(&self) -> TransportResult<()> {
        self.shared.connect_with_retry().await
    }

    /// Send one envelope.
    ///
    /// Connected: serialize, enqueue to the writer, count it, return true.
    /// Disconnected with auto-reconnect: queue FIFO for the next flush and
    /// return false. Disconnected without auto-reconnect: return false.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.shared.send(envelope)
    }

    /// Send a request and wait for the envelope whose `in_reply_to`
    /// capability matches this message id.
    ///
    /// The reply listener is removed exactly once whether the call
    /// resolves, times out, or the send fails.
    pub async fn send_and_wait(
        &self,
        envelope: &Envelope,
        wait: Duration,
    ) -> TransportResult<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel::<Envelope>();
        let slot = Arc::new(Mutex::new(Some(reply_tx)));
        let message_id = envelope.message_id.clone();

        let listener = {
            let slot = Arc::clone(&slot);
            self.shared
                .events
                .on(ChannelEventKind::Message, move |event| {
                    if let ChannelEvent::Message(reply) = event {
                        if reply.capability("in_reply_to") == Some(message_id.as_str()) {
                            if let Some(tx) = locked(&slot).take() {
                                let _ = tx.send(reply.clone());
                            }
                        }
                    }
                })
        };

        if !self.shared.send(envelope) {
            self.shared.events.off(listener);
            return Err(UmicpError::send_failed("request could not be sent"));
        }

        let outcome = timeout(wait, reply_rx).await;
        self.shared.events.off(listener);

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(UmicpError::send_failed(
                "channel dropped while waiting for a reply",
            )),
            Err(_) => Err(UmicpError::timeout(format!(
                "no reply within {}ms",
                wait.as_millis()
            ))),
        }
    }

    /// User-initiated disconnect: disables auto-reconnect, cancels pending
    /// timers, closes the socket, and drops any still-queued unsent
    /// envelopes.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Whether the channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Snapshot of state, counters, and queue depth.
    pub fn stats(&self) -> ChannelStats {
        let state = locked(&self.shared.state);
        ChannelStats {
            url: self.shared.config.url.clone(),
            connected: state.is_connected(),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::SeqCst),
            pending_messages: locked(&self.shared.pending).len(),
            messages_sent: state.messages_sent(),
            messages_received: state.messages_received(),
            bytes_sent: state.bytes_sent(),
            bytes_received: state.bytes_received(),
            uptime: state.uptime(),
        }
    }

    /// The channel's configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: ChannelEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, callback)
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, kind: ChannelEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(kind, callback)
    }

    /// Deregister a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    /// Weak handle for listeners that must not keep the channel alive.
    pub(crate) fn downgrade(&self) -> WeakTransportChannel {
        WeakTransportChannel {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Weak counterpart of [`TransportChannel`]; upgrades fail once every
/// strong handle is gone.
#[derive(Clone)]
pub(crate) struct WeakTransportChannel {
    shared: Weak<ChannelShared>,
}

impl WeakTransportChannel {
    pub(crate) fn upgrade(&self) -> Option<TransportChannel> {
        self.shared
            .upgrade()
            .map(|shared| TransportChannel { shared })
    }
}

impl ChannelShared {
    fn is_connected(&self) -> bool {
        locked(&self.state).is_connected()
    }

    async fn connect_with_retry(self: &Arc<Self>) -> TransportResult<()> {
        loop {
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(url = %self.config.url, error = %err, "connection attempt failed");
                    self.events.emit(&ChannelEvent::Error {
                        message: err.to_string(),
                    });

                    let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let max = self.config.max_reconnect_attempts;
                    if self.auto_reconnect.load(Ordering::SeqCst) && attempt <= max {
                        self.events.emit(&ChannelEvent::Reconnecting { attempt, max });
                        tokio::time::sleep(self.config.reconnect_delay).await;
                    } else {
                        self.reconnecting.store(false, Ordering::SeqCst);
                        return Err(UmicpError::connect_failed(format!(
                            "{}: {err}",
                            self.config.url
                        )));
                    }
                }
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> TransportResult<()> {
        self.events.emit(&ChannelEvent::Connecting);

        let url = url::Url::parse(&self.config.url)
            .map_err(|e| UmicpError::invalid(format!("bad endpoint url: {e}")))?;
        let addrs = url.socket_addrs(|| None)?;
        let addr = *addrs
            .first()
            .ok_or_else(|| UmicpError::connect_failed("endpoint resolved to no address"))?;

        let tcp = timeout(self.config.connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| UmicpError::timeout(format!("connect to {}", self.config.url)))??;

        let (ws_stream, _response) = timeout(
            self.config.connection_timeout,
            client_async(self.config.url.as_str(), tcp),
        )
        .await
        .map_err(|_| UmicpError::timeout("websocket handshake"))?
        .map_err(|e| UmicpError::connect_failed(e.to_string()))?;

        let (mut sink, mut stream) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WsMessage>();

        // Sole writer for this socket; a single consumer keeps sends FIFO.
        let writer_weak = Arc::downgrade(self);
        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let is_close = matches!(message, WsMessage::Close(_));
                if let Err(err) = sink.send(message).await {
                    if let Some(shared) = writer_weak.upgrade() {
                        shared.events.emit(&ChannelEvent::Error {
                            message: format!("write failed: {err}"),
                        });
                    }
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_weak = Arc::downgrade(self);
        let reader_task = tokio::spawn(async move {
            let (code, reason) = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(raw))) => Self::on_raw_message(&reader_weak, &raw),
                    Some(Ok(WsMessage::Binary(raw))) => match String::from_utf8(raw) {
                        Ok(text) => Self::on_raw_message(&reader_weak, &text),
                        Err(_) => Self::emit_error(&reader_weak, "non-utf8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        }
                    }
                    // Ping/pong are answered by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        Self::emit_error(&reader_weak, &format!("read failed: {err}"));
                        break (None, err.to_string());
                    }
                    None => break (None, "stream ended".to_string()),
                }
            };
            if let Some(shared) = reader_weak.upgrade() {
                shared.on_closed(code, reason);
            }
        });

        locked(&self.state).set_connected(true);
        *locked(&self.writer) = Some(writer_tx);
        {
            let mut tasks = locked(&self.tasks);
            if let Some(old) = tasks.writer.replace(writer_task) {
                old.abort();
            }
            if let Some(old) = tasks.reader.replace(reader_task) {
                old.abort();
            }
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.start_heartbeat();

        debug!(url = %self.config.url, "channel connected");
        self.events.emit(&ChannelEvent::Connected);
        self.flush_pending();
        Ok(())
    }

    fn emit_error(weak: &Weak<Self>, message: &str) {
        if let Some(shared) = weak.upgrade() {
            shared.events.emit(&ChannelEvent::Error {
                message: message.to_string(),
            });
        }
    }

    fn on_raw_message(weak: &Weak<Self>, raw: &str) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match Envelope::deserialize(raw) {
            Ok(envelope) => {
                locked(&shared.state).record_received(raw.len() as u64);
                shared.events.emit(&ChannelEvent::Message(envelope));
            }
            Err(err) => shared.events.emit(&ChannelEvent::Error {
                message: err.to_string(),
            }),
        }
    }

    /// Close handling is one-way per connection cycle: the first caller
    /// wins and later close signals for the same cycle are ignored.
    fn on_closed(self: &Arc<Self>, code: Option<u16>, reason: String) {
        {
            let mut state = locked(&self.state);
            if !state.is_connected() {
                return;
            }
            state.set_connected(false);
        }
        if let Some(task) = locked(&self.tasks).heartbeat.take() {
            task.abort();
        }
        locked(&self.writer).take();

        debug!(url = %self.config.url, ?code, %reason, "channel disconnected");
        self.events.emit(&ChannelEvent::Disconnected { code, reason });

        if self.auto_reconnect.load(Ordering::SeqCst)
            && !self.reconnecting.swap(true, Ordering::SeqCst)
        {
            let weak = Arc::downgrade(self);
            let delay = self.config.reconnect_delay;
            debug!(url = %self.config.url, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.events.emit(&ChannelEvent::Reconnecting {
                attempt: self.reconnect_attempts.load(Ordering::SeqCst) + 1,
                max: self.config.max_reconnect_attempts,
            });
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                // disconnect() may have raced the timer.
                if !shared.auto_reconnect.load(Ordering::SeqCst) {
                    shared.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                let _ = shared.connect_with_retry().await;
            });
            if let Some(old) = locked(&self.tasks).reconnect.replace(task) {
                old.abort();
            }
        }
    }

    fn send(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            if self.auto_reconnect.load(Ordering::SeqCst) {
                locked(&self.pending).push_back(envelope.clone());
            }
            return false;
        }

        let raw = match envelope.serialize() {
            Ok(raw) => raw,
            Err(err) => {
                self.events.emit(&ChannelEvent::Error {
                    message: err.to_string(),
                });
                return false;
            }
        };

        let enqueued = locked(&self.writer)
            .as_ref()
            .map(|tx| tx.send(WsMessage::Text(raw.clone())).is_ok())
            .unwrap_or(false);

        if enqueued {
            locked(&self.state).record_sent(raw.len() as u64);
            true
        } else {
            self.events.emit(&ChannelEvent::Error {
                message: "send failed: channel closed".to_string(),
            });
            false
        }
    }

    fn flush_pending(&self) {
        let queued: Vec<Envelope> = locked(&self.pending).drain(..).collect();
        if queued.is_empty() {
            return;
        }

        let mut count = 0;
        for envelope in &queued {
            if self.send(envelope) {
                count += 1;
            }
        }

        debug!(url = %self.config.url, count, "flushed queued messages");
        if count > 0 {
            self.events.emit(&ChannelEvent::MessagesFlushed { count });
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        if self.config.heartbeat_interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.is_connected() {
                    continue;
                }
                let written = locked(&shared.writer)
                    .as_ref()
                    .map(|tx| tx.send(WsMessage::Ping(Vec::new())).is_ok())
                    .unwrap_or(false);
                // A failed heartbeat write is an error event, not a disconnect.
                if !written {
                    shared.events.emit(&ChannelEvent::Error {
                        message: "heartbeat write failed".to_string(),
                    });
                }
            }
        });
        if let Some(old) = locked(&self.tasks).heartbeat.replace(task) {
            old.abort();
        }
    }

    fn disconnect(&self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);

        {
            let mut tasks = locked(&self.tasks);
            if let Some(task) = tasks.reconnect.take() {
                task.abort();
            }
            if let Some(task) = tasks.heartbeat.take() {
                task.abort();
            }
        }

        if let Some(tx) = locked(&self.writer).take() {
            let _ = tx.send(WsMessage::Close(None));
        }

        // Queued unsent messages are dropped, not delivered later.
        locked(&self.pending).clear();

        let was_connected = {
            let mut state = locked(&self.state);
            let was = state.is_connected();
            if was {
                state.set_connected(false);
            }
            was
        };
        if was_connected {
            self.events.emit(&ChannelEvent::Disconnected {
                code: None,
                reason: "disconnect requested".to_string(),
            });
        }
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in [
            tasks.reader.take(),
            tasks.writer.take(),
            tasks.heartbeat.take(),
            tasks.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
