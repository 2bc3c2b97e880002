//! The `error` module defines the error types used within `routemesh`.
//!
//! Each concern gets its own enum so callers can match on the failures they
//! can act on. Transient routing failures are retried inside the router and
//! only surface here once a message's TTL is exhausted.

use thiserror::Error;

/// Terminal and immediate failures of the message router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The message TTL passed before or during delivery.
    #[error("message expired")]
    Expired,

    /// No address could be resolved for the recipient before the TTL ran out.
    #[error("no route found for recipient {0}")]
    NoRouteFound(String),

    /// The transport kept failing until the TTL or retry limit was reached.
    #[error("transmission failed: {0}")]
    TransmissionFailed(String),

    /// A message with the same id is already queued or in flight.
    #[error("message {0} is already scheduled")]
    AlreadyQueued(String),

    /// Delivery was cancelled, for example because the recipient was unregistered.
    #[error("delivery cancelled")]
    Cancelled,

    /// The router is shutting down and no longer accepts messages.
    #[error("router is shut down")]
    Shutdown,
}

/// Failures surfaced to callers of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No request handler is registered for the addressed participant.
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// The reply did not arrive before the request expired.
    #[error("request timed out")]
    Timeout,

    /// The provider's handler failed while serving the request.
    #[error("provider failed: {0}")]
    ProviderRuntime(String),

    /// The message can't be sent as a request, for example because it has
    /// no request-reply id to correlate the reply with.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request could not be delivered.
    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),
}

/// Failures of the capabilities directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The entry violates a directory invariant.
    #[error("invalid discovery entry: {0}")]
    InvalidEntry(String),
}

/// Failures of the durability hook. Always logged, never fatal.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures converting addresses to and from their string form.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid mqtt address: {0}")]
    InvalidMqtt(#[from] serde_json::Error),

    #[error("in-process addresses have no string form")]
    NotSerializable,

    #[error("empty address")]
    Empty,
}

/// Failures of the websocket channel transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed before handshake")]
    HandshakeClosed,
}

/// Result of a single failed transmission attempt, as reported by a
/// transport stub. The router decides from it whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmitError {
    /// Transient failure; retried with exponential backoff.
    #[error("{0}")]
    Failed(String),

    /// Transient failure; retry after exactly this delay.
    #[error("transport requested a retry in {0:?}")]
    Delay(std::time::Duration),

    /// Permanent failure; the message is not retried.
    #[error("message not sent: {0}")]
    NotSent(String),
}
