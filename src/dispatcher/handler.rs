use async_trait::async_trait;

use crate::message::Message;

/// Serves requests addressed to one provider participant.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produces the reply payload. An `Err` goes back to the caller as a
    /// provider runtime error.
    async fn handle(&self, request: &Message) -> Result<Vec<u8>, String>;

    /// Handlers returning true never run two requests at once.
    fn single_threaded(&self) -> bool {
        false
    }
}

/// Receives one-way messages, publications and multicasts for a participant.
///
/// Called on the intake path, so implementations should hand off anything slow.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);
}
