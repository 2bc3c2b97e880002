//! Transport addresses.
//!
//! An [`Address`] says how a participant can be reached. Each variant maps to
//! exactly one [`TransportKind`], which the router uses to pick a transport
//! stub.
//!
//! String form (used at rest and wherever addresses travel as text):
//! - `Channel` is the raw channel identifier, no wrapping
//! - `Mqtt` is a JSON object `{"brokerUri": ..., "topic": ...}`
//! - parsing treats input starting with `{` as MQTT JSON and anything else as
//!   a channel identifier
//! - `InProcess` has no string form

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::AddressError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    InProcess,
    Channel {
        channel_id: String,
    },
    Mqtt {
        #[serde(rename = "brokerUri")]
        broker_uri: String,
        topic: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    InProcess,
    Channel,
    Mqtt,
}

#[derive(Serialize, Deserialize)]
struct MqttAddressJson {
    #[serde(rename = "brokerUri")]
    broker_uri: String,
    topic: String,
}

impl Address {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Address::Channel {
            channel_id: channel_id.into(),
        }
    }

    pub fn mqtt(broker_uri: impl Into<String>, topic: impl Into<String>) -> Self {
        Address::Mqtt {
            broker_uri: broker_uri.into(),
            topic: topic.into(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Address::InProcess => TransportKind::InProcess,
            Address::Channel { .. } => TransportKind::Channel,
            Address::Mqtt { .. } => TransportKind::Mqtt,
        }
    }

    /// Serializes the address to its string form.
    pub fn to_wire_string(&self) -> Result<String, AddressError> {
        match self {
            Address::InProcess => Err(AddressError::NotSerializable),
            Address::Channel { channel_id } => Ok(channel_id.clone()),
            Address::Mqtt { broker_uri, topic } => {
                let json = MqttAddressJson {
                    broker_uri: broker_uri.clone(),
                    topic: topic.clone(),
                };
                Ok(serde_json::to_string(&json)?)
            }
        }
    }

    /// Parses the string form produced by [`Address::to_wire_string`].
    pub fn from_wire_string(input: &str) -> Result<Self, AddressError> {
        if input.is_empty() {
            return Err(AddressError::Empty);
        }
        if input.starts_with('{') {
            let json: MqttAddressJson = serde_json::from_str(input)?;
            return Ok(Address::Mqtt {
                broker_uri: json.broker_uri,
                topic: json.topic,
            });
        }
        Ok(Address::channel(input))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_wire_string(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::InProcess => write!(f, "in-process"),
            Address::Channel { channel_id } => write!(f, "channel:{channel_id}"),
            Address::Mqtt { broker_uri, topic } => write!(f, "mqtt:{broker_uri}/{topic}"),
        }
    }
}
