//! Testing utilities and mock implementations
//!
//! Lets the bridge be tested without an MQTT broker.

pub mod mocks;

pub use mocks::*;
