//! Message definitions
//!
//! `Message` is the canonical wire/internal representation routed between
//! participants. It is immutable once built: fields are private and only
//! exposed through getters, and `ttl_absolute_ms` is fixed at creation.
//!
//! Notes on fields:
//! - `id`: opaque unique id, generated (uuid v4) unless the builder sets one
//! - `sender` / `recipient`: participant ids, never network endpoints
//! - `ttl_absolute_ms`: absolute deadline in milliseconds since UNIX epoch
//! - `payload`: opaque bytes
//! - `headers`: ordered key/value pairs. Application headers carry the
//!   [`CUSTOM_HEADER_PREFIX`] prefix, headers added by the middleware itself
//!   carry [`PROCESSOR_HEADER_PREFIX`]

pub mod delayable;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::DispatchError;

pub use delayable::{DelayableMessage, FailureAction, StoredMessage};

pub type MessageId = String;
pub type ParticipantId = String;

pub const CUSTOM_HEADER_PREFIX: &str = "c-";
pub const PROCESSOR_HEADER_PREFIX: &str = "p-";

/// Correlates a reply with the request that caused it.
pub const HEADER_REQUEST_REPLY_ID: &str = "p-requestReplyId";
/// Present on error replies; names the error kind.
pub const HEADER_ERROR: &str = "p-error";

const ERROR_UNKNOWN_PARTICIPANT: &str = "UnknownParticipant";
const ERROR_PROVIDER_RUNTIME: &str = "ProviderRuntime";
const ERROR_TIMEOUT: &str = "Timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Reply,
    OneWay,
    SubscriptionRequest,
    SubscriptionReply,
    Publication,
    Multicast,
}

impl MessageType {
    /// Message types answered with a reply.
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::Request | MessageType::SubscriptionRequest)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Reply | MessageType::SubscriptionReply)
    }

    /// The reply type matching a request type.
    pub fn reply_type(self) -> Option<MessageType> {
        match self {
            MessageType::Request => Some(MessageType::Reply),
            MessageType::SubscriptionRequest => Some(MessageType::SubscriptionReply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: ParticipantId,
    recipient: ParticipantId,
    message_type: MessageType,
    ttl_absolute_ms: i64,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

impl Message {
    pub fn builder(
        message_type: MessageType,
        sender: impl Into<ParticipantId>,
        recipient: impl Into<ParticipantId>,
    ) -> MessageBuilder {
        MessageBuilder::new(message_type, sender, recipient)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn ttl_absolute_ms(&self) -> i64 {
        self.ttl_absolute_ms
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Application-supplied headers with the prefix stripped.
    pub fn custom_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().filter_map(|(k, v)| {
            k.strip_prefix(CUSTOM_HEADER_PREFIX)
                .map(|key| (key, v.as_str()))
        })
    }

    pub fn request_reply_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_REPLY_ID)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl_absolute_ms <= now_ms
    }

    /// Builds the reply to this request carrying `payload`.
    ///
    /// Sender and recipient are swapped and the request's TTL and
    /// request-reply id are carried over.
    pub fn create_reply(&self, payload: Vec<u8>) -> Message {
        let mut builder = Message::builder(
            self.message_type.reply_type().unwrap_or(MessageType::Reply),
            self.recipient.clone(),
            self.sender.clone(),
        )
        .ttl_absolute_ms(self.ttl_absolute_ms)
        .payload(payload);
        if let Some(id) = self.request_reply_id() {
            builder = builder.processor_header(HEADER_REQUEST_REPLY_ID, id);
        }
        builder.build()
    }

    /// Builds an error reply to this request.
    pub fn create_error_reply(&self, error: &DispatchError) -> Message {
        let (kind, detail) = match error {
            DispatchError::UnknownParticipant(p) => (ERROR_UNKNOWN_PARTICIPANT, p.clone()),
            DispatchError::Timeout => (ERROR_TIMEOUT, String::new()),
            DispatchError::ProviderRuntime(detail) => (ERROR_PROVIDER_RUNTIME, detail.clone()),
            other => (ERROR_PROVIDER_RUNTIME, other.to_string()),
        };
        let mut reply = self.create_reply(detail.into_bytes());
        reply
            .headers
            .insert(HEADER_ERROR.to_string(), kind.to_string());
        reply
    }

    /// Decodes an error reply, if this is one.
    pub fn reply_error(&self) -> Option<DispatchError> {
        let kind = self.header(HEADER_ERROR)?;
        let detail = String::from_utf8_lossy(&self.payload).into_owned();
        Some(match kind {
            ERROR_UNKNOWN_PARTICIPANT => DispatchError::UnknownParticipant(detail),
            ERROR_TIMEOUT => DispatchError::Timeout,
            _ => DispatchError::ProviderRuntime(detail),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    sender: ParticipantId,
    recipient: ParticipantId,
    message_type: MessageType,
    ttl_absolute_ms: i64,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

impl MessageBuilder {
    /// Default relative TTL when none is set.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(
        message_type: MessageType,
        sender: impl Into<ParticipantId>,
        recipient: impl Into<ParticipantId>,
    ) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            ttl_absolute_ms: chrono::Utc::now().timestamp_millis()
                + Self::DEFAULT_TTL.as_millis() as i64,
            payload: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn ttl_absolute_ms(mut self, ttl_absolute_ms: i64) -> Self {
        self.ttl_absolute_ms = ttl_absolute_ms;
        self
    }

    /// Sets the TTL relative to the wall clock.
    pub fn ttl_from_now(mut self, ttl: Duration) -> Self {
        self.ttl_absolute_ms = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Adds an application header; the custom prefix is added here.
    pub fn custom_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers
            .insert(format!("{CUSTOM_HEADER_PREFIX}{key}"), value.into());
        self
    }

    /// Adds a middleware header. `key` must already carry the processor prefix.
    pub fn processor_header(mut self, key: &str, value: impl Into<String>) -> Self {
        debug_assert!(key.starts_with(PROCESSOR_HEADER_PREFIX));
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Tags the message with a fresh request-reply id and returns it alongside.
    pub fn with_request_reply_id(self) -> (Self, String) {
        let id = Uuid::new_v4().to_string();
        (self.processor_header(HEADER_REQUEST_REPLY_ID, id.clone()), id)
    }

    pub fn build(self) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender: self.sender,
            recipient: self.recipient,
            message_type: self.message_type,
            ttl_absolute_ms: self.ttl_absolute_ms,
            payload: self.payload,
            headers: self.headers,
        }
    }
}
