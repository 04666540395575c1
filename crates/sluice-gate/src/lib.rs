//! Client side of the downstream admission API.

pub mod http;
pub mod mock;

pub use http::{request_body, GateConfig, HttpGate};
pub use mock::MockGate;
