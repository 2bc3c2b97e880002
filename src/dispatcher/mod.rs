//! The `dispatcher` module is where messages enter and leave a node's
//! participants.
//!
//! Callers send through the [`Dispatcher`]; transports hand every inbound
//! message to [`Dispatcher::message_arrived`], which correlates replies with
//! their waiters and runs request handlers on a bounded pool.

mod engine;
mod handler;
mod reply_caller;

pub use engine::Dispatcher;
pub use handler::{MessageListener, RequestHandler};
pub use reply_caller::ReplyCallback;

#[cfg(test)]
mod tests;
