//! The `routing` module moves messages from their sender to a transport.
//!
//! - `table`: participant id to address resolution
//! - `queue`: the delay queue of outbound messages
//! - `backoff`: retry delays
//! - `stub`: the contract transports implement
//! - `router`: the workers tying the above together

pub mod backoff;
pub mod queue;
pub mod router;
pub mod stub;
pub mod table;

pub use backoff::RetryBackoff;
pub use queue::DelayableMessageQueue;
pub use router::{DeliveryOutcome, MessageProcessedListener, MessageRouter, MessageRouterBuilder};
pub use stub::{StubRegistry, TransmitError, TransportStub};
pub use table::{RoutingEntry, RoutingTable};
