use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;

use super::frame::ChannelFrame;
use super::registry::{ChannelConnection, ChannelRegistry, OutboundFrame};
use crate::address::Address;
use crate::backpressure::BackpressureController;
use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::routing::{TransmitError, TransportStub};
use crate::utils::error::TransportError;

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// The local side of every channel connection: who we are, where inbound
/// messages go, and where open connections are kept.
#[derive(Clone)]
pub struct ChannelEndpoint {
    local_channel_id: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ChannelRegistry>,
    backpressure: Option<Arc<BackpressureController>>,
}

impl ChannelEndpoint {
    pub fn new(
        local_channel_id: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ChannelRegistry>,
        backpressure: Option<Arc<BackpressureController>>,
    ) -> Self {
        Self {
            local_channel_id: local_channel_id.into(),
            dispatcher,
            registry,
            backpressure,
        }
    }

    pub fn local_channel_id(&self) -> &str {
        &self.local_channel_id
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Passes an inbound message through the backpressure gate to the
    /// dispatcher, remembering the channel its sender can be answered on.
    fn deliver(&self, peer_channel_id: &str, message: Message) {
        if let Some(backpressure) = &self.backpressure {
            backpressure.on_message_received();
            if !backpressure.admit_message(&message) {
                return;
            }
        }

        let routing_table = self.dispatcher.router().routing_table();
        if !routing_table.contains(message.sender()) {
            routing_table.add(message.sender(), Address::channel(peer_channel_id), false);
        }
        self.dispatcher.message_arrived(message);
    }
}

/// A running channel server.
#[derive(Debug)]
pub struct ChannelServer {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

impl ChannelServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Open connections stay up.
    pub fn stop(&self) {
        self.accept_loop.abort();
    }
}

/// Binds `addr` and accepts channel connections in the background
/// Every peer announces its channel id with a `hello` frame and is then
/// reachable through the channel registry under that id
pub async fn start_channel_server(
    addr: &str,
    endpoint: ChannelEndpoint,
) -> Result<ChannelServer, TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Channel server listening on ws://{local_addr}");

    let accept_loop = tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                    continue;
                }
            };

            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let ws_stream = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        warn!("WebSocket handshake with {peer_addr} failed: {e}");
                        return;
                    }
                };
                match handshake(&endpoint, ws_stream).await {
                    Ok((peer_channel_id, sink, source)) => {
                        run_connection(endpoint, peer_channel_id, sink, source, false).await;
                    }
                    Err(e) => warn!("Channel handshake with {peer_addr} failed: {e}"),
                }
            });
        }
    });

    Ok(ChannelServer {
        local_addr,
        accept_loop,
    })
}

/// An outgoing connection to a channel server.
#[derive(Debug)]
pub struct ChannelClient {
    peer_channel_id: String,
    connection: JoinHandle<()>,
}

impl ChannelClient {
    /// Dials `url` and completes the hello exchange before returning, so the
    /// server's channel is reachable as soon as this resolves.
    pub async fn connect(url: &str, endpoint: ChannelEndpoint) -> Result<Self, TransportError> {
        if let Some(backpressure) = &endpoint.backpressure {
            backpressure.on_connection_attempt();
        }
        let (ws_stream, _) = connect_async(url).await?;
        let (peer_channel_id, sink, source) = handshake(&endpoint, ws_stream).await?;
        if let Some(backpressure) = &endpoint.backpressure {
            backpressure.on_connected();
        }

        let connection = tokio::spawn(run_connection(
            endpoint,
            peer_channel_id.clone(),
            sink,
            source,
            true,
        ));
        Ok(Self {
            peer_channel_id,
            connection,
        })
    }

    pub fn peer_channel_id(&self) -> &str {
        &self.peer_channel_id
    }

    pub fn close(&self) {
        self.connection.abort();
    }
}

/// Sends our hello and waits for the peer's.
async fn handshake<S>(
    endpoint: &ChannelEndpoint,
    ws_stream: WebSocketStream<S>,
) -> Result<(String, WsSink<S>, WsSource<S>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws_stream.split();
    let hello = ChannelFrame::Hello {
        channel_id: endpoint.local_channel_id.clone(),
    };
    sink.send(WsMessage::text(serde_json::to_string(&hello)?)).await?;

    while let Some(msg) = source.next().await {
        match msg? {
            WsMessage::Text(text) => match serde_json::from_str::<ChannelFrame>(text.as_str())? {
                ChannelFrame::Hello { channel_id } => return Ok((channel_id, sink, source)),
                ChannelFrame::Message { message } => {
                    warn!("Message {} arrived before hello, dropped", message.id());
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::HandshakeClosed)
}

async fn run_connection<S>(
    endpoint: ChannelEndpoint,
    peer_channel_id: String,
    mut sink: WsSink<S>,
    mut source: WsSource<S>,
    track_connection: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    endpoint.registry.register(ChannelConnection {
        channel_id: peer_channel_id.clone(),
        sender: tx.clone(),
    });

    // Forward queued frames to the socket
    let send_channel_id = peer_channel_id.clone();
    let send_loop = tokio::spawn(async move {
        while let Some(OutboundFrame { message, written }) = rx.recv().await {
            let result = sink.send(message).await.map_err(|e| e.to_string());
            let failed = result.is_err();
            if let Err(e) = &result {
                warn!("Failed to send to channel {send_channel_id}: {e}");
            }
            if let Some(written) = written {
                let _ = written.send(result);
            }
            if failed {
                break;
            }
        }
        let _ = sink.close().await;
        trace!("Send loop closed for {send_channel_id}");
    });

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Channel {peer_channel_id} read error: {e}");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ChannelFrame>(text.as_str()) {
                Ok(ChannelFrame::Message { message }) => endpoint.deliver(&peer_channel_id, message),
                Ok(ChannelFrame::Hello { .. }) => {
                    debug!("Ignoring repeated hello from {peer_channel_id}");
                }
                Err(e) => warn!("Invalid frame from {peer_channel_id}: {e}"),
            },
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => warn!("Ignoring binary frame from {peer_channel_id}"),
            _ => {}
        }
    }

    endpoint.registry.remove(&peer_channel_id, &tx);
    drop(tx);
    send_loop.abort();
    if track_connection {
        if let Some(backpressure) = &endpoint.backpressure {
            backpressure.on_disconnected();
        }
    }
}

/// Router stub for `Channel` addresses: writes the message to the registered
/// connection of the target channel and reports success only once the socket
/// write is done. A channel that isn't connected yet is a transient failure,
/// so the router keeps retrying until the peer shows up.
pub struct ChannelStub {
    registry: Arc<ChannelRegistry>,
    backpressure: Option<Arc<BackpressureController>>,
}

impl ChannelStub {
    pub fn new(registry: Arc<ChannelRegistry>, backpressure: Option<Arc<BackpressureController>>) -> Self {
        Self {
            registry,
            backpressure,
        }
    }
}

#[async_trait]
impl TransportStub for ChannelStub {
    async fn transmit(&self, message: &Message, address: &Address) -> Result<(), TransmitError> {
        let Address::Channel { channel_id } = address else {
            return Err(TransmitError::NotSent(format!(
                "channel stub can't reach {address}"
            )));
        };
        self.registry
            .send(
                channel_id,
                &ChannelFrame::Message {
                    message: message.clone(),
                },
            )
            .await?;
        if let Some(backpressure) = &self.backpressure {
            backpressure.on_message_sent();
        }
        Ok(())
    }
}
