//! The `utils` module provides a collection of utility functions and common
//! definitions used across `routemesh`.
//!
//! It centralizes the error types shared by every component, the tracing
//! initialisation used by the binary and the tests, and the clock abstraction
//! that lets TTL and staleness checks run against a controllable time source.

pub mod clock;
pub mod error;
pub mod logging;
