//! End-to-end channel behavior over real sockets: ordering, queue-and-flush
//! across a reconnect, request-response correlation, and the heartbeat.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use umicp_core::{Envelope, OperationType};
use umicp_transport::{
    ChannelConfig, ChannelEvent, ChannelEventKind, ChannelServer, ServerConfig, ServerEvent,
    ServerEventKind, TransportChannel,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("umicp_transport=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server() -> (ChannelServer, std::net::SocketAddr) {
    let server = ChannelServer::new(ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    });
    let addr = server.start().await.expect("server start");
    (server, addr)
}

fn collect_server_messages(server: &ChannelServer) -> Arc<Mutex<Vec<Envelope>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    server.on(ServerEventKind::Message, move |event| {
        if let ServerEvent::Message { envelope, .. } = event {
            sink.lock().unwrap().push(envelope.clone());
        }
    });
    received
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn numbered(seq: usize) -> Envelope {
    Envelope::new("client", "server", OperationType::Data)
        .with_capability("seq", seq.to_string())
}

#[tokio::test]
async fn sends_arrive_in_order() {
    init_tracing();
    let (server, addr) = start_server().await;
    let received = collect_server_messages(&server);

    let channel = TransportChannel::new(ChannelConfig::new(format!("ws://{addr}")));
    channel.connect().await.expect("connect");

    for seq in 0..20 {
        assert!(channel.send(&numbered(seq)));
    }
    wait_until("all sends to arrive", || received.lock().unwrap().len() == 20).await;

    let seqs: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .map(|envelope| envelope.capability("seq").unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..20).map(|seq| seq.to_string()).collect();
    assert_eq!(seqs, expected);

    channel.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn queued_messages_flush_in_order_after_reconnect() {
    init_tracing();
    let (server, addr) = start_server().await;
    let received = collect_server_messages(&server);

    let channel = TransportChannel::new(ChannelConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 10,
        heartbeat_interval: Duration::ZERO,
        ..ChannelConfig::new(format!("ws://{addr}"))
    });

    let flushed = Arc::new(Mutex::new(Vec::new()));
    let flush_sink = Arc::clone(&flushed);
    channel.on(ChannelEventKind::MessagesFlushed, move |event| {
        if let ChannelEvent::MessagesFlushed { count } = event {
            flush_sink.lock().unwrap().push(*count);
        }
    });
    let reconnects = Arc::new(Mutex::new(Vec::new()));
    let reconnect_sink = Arc::clone(&reconnects);
    channel.on(ChannelEventKind::Reconnecting, move |event| {
        if let ChannelEvent::Reconnecting { attempt, max } = event {
            reconnect_sink.lock().unwrap().push((*attempt, *max));
        }
    });

    channel.connect().await.expect("connect");
    wait_until("server to see the client", || server.client_count() == 1).await;

    // Kick the client from the server side and queue sends during the gap.
    let client = server.clients()[0].id;
    assert!(server.disconnect_client(client));
    wait_until("channel to notice the drop", || !channel.is_connected()).await;

    // Queued sends report false until the flush delivers them.
    for seq in 0..3 {
        assert!(!channel.send(&numbered(seq)));
    }
    assert_eq!(channel.stats().pending_messages, 3);

    wait_until("reconnect and flush", || received.lock().unwrap().len() == 3).await;
    let seqs: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .map(|envelope| envelope.capability("seq").unwrap().to_string())
        .collect();
    assert_eq!(seqs, vec!["0", "1", "2"]);
    assert_eq!(*flushed.lock().unwrap(), vec![3]);
    // The drop announces the scheduled retry; the server is back up, so
    // that first attempt is also the last.
    assert_eq!(*reconnects.lock().unwrap(), vec![(1, 10)]);

    channel.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn send_and_wait_times_out_without_reply() {
    init_tracing();
    let (server, addr) = start_server().await;

    let channel = TransportChannel::new(ChannelConfig::new(format!("ws://{addr}")));
    channel.connect().await.expect("connect");

    let request = Envelope::new("client", "server", OperationType::Request);
    let start = Instant::now();
    let result = channel
        .send_and_wait(&request, Duration::from_millis(100))
        .await;
    let elapsed = start.elapsed();

    let err = result.expect_err("no reply was sent");
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(250));

    channel.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn send_and_wait_resolves_on_correlated_reply() {
    init_tracing();
    let (server, addr) = start_server().await;

    let responder = server.clone();
    server.on(ServerEventKind::Message, move |event| {
        if let ServerEvent::Message { envelope, client } = event {
            let reply = Envelope::new("server", "client", OperationType::Response)
                .with_capability("in_reply_to", envelope.message_id.clone())
                .with_capability("answer", "42");
            responder.send_to_client(client.id, &reply);
        }
    });

    let channel = TransportChannel::new(ChannelConfig::new(format!("ws://{addr}")));
    channel.connect().await.expect("connect");

    let request = Envelope::new("client", "server", OperationType::Request);
    let reply = channel
        .send_and_wait(&request, Duration::from_secs(2))
        .await
        .expect("correlated reply");

    assert_eq!(reply.operation, OperationType::Response);
    assert_eq!(reply.capability("in_reply_to"), Some(request.message_id.as_str()));
    assert_eq!(reply.capability("answer"), Some("42"));

    channel.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn heartbeat_pings_flow_at_the_configured_interval() {
    init_tracing();

    // Raw accept loop so ping frames are visible; ChannelServer swallows
    // them at the protocol layer.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ping_tx, mut ping_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws_stream.next().await {
            if matches!(message, WsMessage::Ping(_)) && ping_tx.send(()).is_err() {
                break;
            }
        }
    });

    let channel = TransportChannel::new(ChannelConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ChannelConfig::new(format!("ws://{addr}"))
    });
    channel.connect().await.expect("connect");

    let mut pings = 0;
    let deadline = Instant::now() + Duration::from_secs(2);
    while pings < 2 && Instant::now() < deadline {
        if tokio::time::timeout(Duration::from_millis(100), ping_rx.recv())
            .await
            .is_ok()
        {
            pings += 1;
        }
    }
    assert!(pings >= 2, "expected at least two heartbeat pings");

    channel.disconnect();
}
