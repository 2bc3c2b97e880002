use serde::{Deserialize, Serialize};

use crate::message::Message;

/// What travels over a channel connection, one JSON text frame each.
///
/// Both ends open with `hello` to announce their channel id, then exchange
/// `message` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    Hello { channel_id: String },
    Message { message: Message },
}
