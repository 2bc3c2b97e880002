//! The `backpressure` module protects a node from more inbound requests than
//! it can serve.
//!
//! Once the number of requests being processed reaches the configured
//! maximum, further requests are dropped until processing catches up to the
//! lower threshold. Everything that is not a request passes unconditionally.

mod controller;

pub use controller::{BackpressureController, BackpressureMetrics};
