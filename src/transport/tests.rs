use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use super::*;
use crate::address::Address;
use crate::capabilities::ProviderQos;
use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::message::{Message, MessageType};
use crate::node::{Node, PING_PARTICIPANT_ID, PingHandler};
use crate::routing::{MessageRouter, TransmitError, TransportStub};
use crate::utils::clock::system_clock;

fn node_settings(channel_id: &str) -> Settings {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.server.channel_id = channel_id.to_string();
    settings.router.retry_interval_ms = 10;
    settings.router.max_delay_ms = 50;
    settings.router.jitter_ratio = 0.0;
    settings
}

#[test]
fn test_frame_wire_format() {
    let hello = ChannelFrame::Hello {
        channel_id: "node-a".to_string(),
    };
    assert_eq!(
        serde_json::to_value(&hello).unwrap(),
        json!({"type": "hello", "channel_id": "node-a"})
    );

    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    let frame = ChannelFrame::Message {
        message: message.clone(),
    };
    let text = serde_json::to_string(&frame).unwrap();
    assert!(text.starts_with(r#"{"type":"message""#));
    let parsed: ChannelFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, ChannelFrame::Message { message });
}

#[tokio::test]
async fn test_registry_send_to_unknown_channel_is_transient_failure() {
    let registry = ChannelRegistry::new();
    let frame = ChannelFrame::Hello {
        channel_id: "x".to_string(),
    };
    assert!(matches!(
        registry.send("missing", &frame).await,
        Err(TransmitError::Failed(_))
    ));
}

/// Stands in for a connection's send loop: answers every frame with `result`
/// and returns what it was asked to write.
fn fake_send_loop(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    result: Result<(), String>,
) -> tokio::task::JoinHandle<Vec<WsMessage>> {
    tokio::spawn(async move {
        let mut written = Vec::new();
        while let Some(frame) = rx.recv().await {
            written.push(frame.message);
            if let Some(ack) = frame.written {
                let _ = ack.send(result.clone());
            }
        }
        written
    })
}

#[tokio::test]
async fn test_registry_keeps_newer_connection_on_stale_remove() {
    let registry = ChannelRegistry::new();
    let (old_tx, _old_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let (new_tx, new_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let send_loop = fake_send_loop(new_rx, Ok(()));

    registry.register(ChannelConnection {
        channel_id: "peer".to_string(),
        sender: old_tx.clone(),
    });
    registry.register(ChannelConnection {
        channel_id: "peer".to_string(),
        sender: new_tx.clone(),
    });
    registry.remove("peer", &old_tx);
    assert!(registry.is_connected("peer"));

    let frame = ChannelFrame::Hello {
        channel_id: "me".to_string(),
    };
    registry.send("peer", &frame).await.unwrap();

    registry.remove("peer", &new_tx);
    assert!(registry.is_empty());
    drop(new_tx);
    assert_eq!(send_loop.await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_channel_stub_fails_when_connection_drops_before_write() {
    let registry = Arc::new(ChannelRegistry::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    registry.register(ChannelConnection {
        channel_id: "peer".to_string(),
        sender: tx,
    });
    // the connection takes the frame and goes away without writing it
    tokio::spawn(async move {
        let frame = rx.recv().await;
        drop(frame);
        drop(rx);
    });

    let stub = ChannelStub::new(registry, None);
    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    assert!(matches!(
        stub.transmit(&message, &Address::channel("peer")).await,
        Err(TransmitError::Failed(_))
    ));
}

#[tokio::test]
async fn test_channel_stub_reports_failed_socket_write() {
    let registry = Arc::new(ChannelRegistry::new());
    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
    registry.register(ChannelConnection {
        channel_id: "peer".to_string(),
        sender: tx,
    });
    let _send_loop = fake_send_loop(rx, Err("connection reset".to_string()));

    let stub = ChannelStub::new(registry, None);
    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    let result = stub.transmit(&message, &Address::channel("peer")).await;
    assert!(matches!(result, Err(TransmitError::Failed(reason)) if reason.contains("connection reset")));
}

#[tokio::test]
async fn test_channel_stub_succeeds_after_write() {
    let registry = Arc::new(ChannelRegistry::new());
    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
    registry.register(ChannelConnection {
        channel_id: "peer".to_string(),
        sender: tx.clone(),
    });
    let send_loop = fake_send_loop(rx, Ok(()));

    let stub = ChannelStub::new(registry.clone(), None);
    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    stub.transmit(&message, &Address::channel("peer")).await.unwrap();

    registry.remove("peer", &tx);
    drop(tx);
    drop(stub);
    drop(registry);
    let written = send_loop.await.unwrap();
    let WsMessage::Text(text) = &written[0] else {
        panic!("expected a text frame");
    };
    let frame: ChannelFrame = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(frame, ChannelFrame::Message { message });
}

#[tokio::test]
async fn test_in_process_stub_without_dispatcher_is_not_sent() {
    let router = MessageRouter::builder(Settings::default().router).build();
    let dispatcher = Dispatcher::new(
        router,
        &Settings::default().dispatcher,
        system_clock(),
        None,
    );
    let stub = InProcessStub::new(&dispatcher);
    drop(dispatcher);

    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    assert!(matches!(
        stub.transmit(&message, &Address::InProcess).await,
        Err(TransmitError::NotSent(_))
    ));
}

#[tokio::test]
async fn test_channel_stub_rejects_other_addresses() {
    let stub = ChannelStub::new(Arc::new(ChannelRegistry::new()), None);
    let message = Message::builder(MessageType::OneWay, "s", "r").build();
    assert!(matches!(
        stub.transmit(&message, &Address::InProcess).await,
        Err(TransmitError::NotSent(_))
    ));
}

#[tokio::test]
async fn test_request_reply_across_channel() {
    let server = Node::new(node_settings("server-node")).unwrap();
    server
        .register_provider(
            PING_PARTICIPANT_ID,
            "routemesh",
            "ping",
            Arc::new(PingHandler),
            ProviderQos::default(),
        )
        .unwrap();
    server.start();
    let listener = server.serve().await.unwrap();

    let client = Node::new(node_settings("client-node")).unwrap();
    client.start();
    let connection = client
        .connect(&format!("ws://{}", listener.local_addr()))
        .await
        .unwrap();
    assert_eq!(connection.peer_channel_id(), "server-node");

    client.register_local_participant("consumer");
    client.routing_table().add(
        PING_PARTICIPANT_ID,
        Address::channel(connection.peer_channel_id()),
        true,
    );

    let (builder, _) = Message::builder(MessageType::Request, "consumer", PING_PARTICIPANT_ID)
        .ttl_from_now(Duration::from_secs(5))
        .with_request_reply_id();
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        client.dispatcher().request(builder.build()),
    )
    .await
    .expect("reply in time");
    assert_eq!(reply, Ok(b"pong".to_vec()));

    // the server learned the way back to the consumer from the request
    assert_eq!(
        server.routing_table().get("consumer"),
        Some(Address::channel("client-node"))
    );
    let client_metrics = client.backpressure().metrics();
    assert!(client_metrics.connected);
    assert_eq!(client_metrics.connection_attempts, 1);
    assert!(client_metrics.messages_sent >= 1);
    assert!(server.backpressure().metrics().messages_received >= 1);

    connection.close();
    listener.stop();
    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_message_waits_for_channel_to_connect() {
    let server = Node::new(node_settings("late-server")).unwrap();
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));

    struct Collector(Arc<std::sync::Mutex<Vec<Message>>>);
    impl crate::dispatcher::MessageListener for Collector {
        fn on_message(&self, message: &Message) {
            self.0.lock().unwrap().push(message.clone());
        }
    }
    server
        .dispatcher()
        .register_message_listener("subscriber", Arc::new(Collector(received.clone())));
    server.start();

    let client = Node::new(node_settings("early-client")).unwrap();
    client.start();
    client
        .routing_table()
        .add("subscriber", Address::channel("late-server"), true);
    let publication = Message::builder(MessageType::Publication, "publisher", "subscriber")
        .ttl_from_now(Duration::from_secs(5))
        .payload(b"news".to_vec())
        .build();
    client.dispatcher().send(publication.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().unwrap().is_empty());

    let listener = server.serve().await.unwrap();
    let _connection = client
        .connect(&format!("ws://{}", listener.local_addr()))
        .await
        .unwrap();

    for _ in 0..200 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*received.lock().unwrap(), vec![publication]);

    listener.stop();
    client.shutdown().await;
    server.shutdown().await;
}
