//! # routemesh
//!
//! `routemesh` is location-transparent RPC and publish/subscribe middleware.
//! Callers address logical participants rather than network endpoints; the
//! middleware resolves where a participant lives, delivers messages reliably
//! across transient failures and sheds load it can't serve.
//!
//! ## Core Modules
//!
//! - `address`: where a participant can be reached, one variant per transport.
//! - `message`: the immutable message envelope and its queued form.
//! - `routing`: routing table, delay queue, retry backoff and the router workers.
//! - `capabilities`: the directory of provider registrations with staleness-aware lookup.
//! - `dispatcher`: reply correlation, request handlers and message listeners.
//! - `backpressure`: admission control for inbound requests.
//! - `persistence`: durability hook for queued messages, backed by `sled`.
//! - `transport`: in-process delivery and the websocket channel transport.
//! - `node`: assembles the above from `Settings` and runs the maintenance tick.
//! - `config`: layered configuration from file and environment.
//! - `utils`: errors, logging and the clock.

pub mod address;
pub mod backpressure;
pub mod capabilities;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod node;
pub mod persistence;
pub mod routing;
pub mod transport;
pub mod utils;
