//! The `transport` module connects the router to the outside world.
//!
//! - `in_process`: delivery to participants on the same node
//! - `websocket`: the channel transport, a websocket connection per peer
//!   node carrying JSON frames
//! - `registry`: open channel connections by channel id
//! - `frame`: the channel wire format
//!
//! Inbound channel traffic passes the backpressure gate before it reaches
//! the dispatcher.

pub mod frame;
pub mod in_process;
pub mod registry;
pub mod websocket;

pub use frame::ChannelFrame;
pub use in_process::InProcessStub;
pub use registry::{ChannelConnection, ChannelRegistry, OutboundFrame};
pub use websocket::{
    ChannelClient, ChannelEndpoint, ChannelServer, ChannelStub, start_channel_server,
};

#[cfg(test)]
mod tests;
