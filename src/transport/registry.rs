use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;

use super::frame::ChannelFrame;
use crate::routing::TransmitError;

/// A frame waiting for the send loop of its connection. `written` learns
/// whether the socket write went through; dropping it unanswered means the
/// connection went away first.
#[derive(Debug)]
pub struct OutboundFrame {
    pub message: WsMessage,
    pub written: Option<oneshot::Sender<Result<(), String>>>,
}

/// Write half of one peer connection
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    pub channel_id: String,
    pub sender: UnboundedSender<OutboundFrame>,
}

/// Open channel connections by the channel id each peer announced.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<String, ChannelConnection>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, replacing an older one for the same channel.
    pub fn register(&self, connection: ChannelConnection) {
        info!("Channel {} connected", connection.channel_id);
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.channel_id.clone(), connection);
    }

    /// Removes the connection of `channel_id` unless a newer connection has
    /// taken its place.
    pub fn remove(&self, channel_id: &str, sender: &UnboundedSender<OutboundFrame>) {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        let is_current = connections
            .get(channel_id)
            .is_some_and(|c| c.sender.same_channel(sender));
        if is_current {
            connections.remove(channel_id);
            info!("Channel {channel_id} disconnected");
        }
    }

    pub fn is_connected(&self, channel_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `frame` to the connection of `channel_id` and resolves once the
    /// socket write has completed. A channel that is not connected, or whose
    /// connection drops before the write, is a transient failure.
    pub async fn send(&self, channel_id: &str, frame: &ChannelFrame) -> Result<(), TransmitError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransmitError::NotSent(format!("unserializable frame: {e}")))?;
        let sender = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .map(|c| c.sender.clone())
            .ok_or_else(|| TransmitError::Failed(format!("channel {channel_id} is not connected")))?;

        let (written_tx, written_rx) = oneshot::channel();
        let outbound = OutboundFrame {
            message: WsMessage::text(text),
            written: Some(written_tx),
        };
        sender.send(outbound).map_err(|_| {
            debug!("Send loop of channel {channel_id} already closed");
            TransmitError::Failed(format!("channel {channel_id} is closing"))
        })?;

        match written_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransmitError::Failed(format!(
                "write to channel {channel_id} failed: {e}"
            ))),
            Err(_) => Err(TransmitError::Failed(format!(
                "channel {channel_id} closed before the frame was written"
            ))),
        }
    }
}
