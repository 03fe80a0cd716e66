//! Agent side of the coordinator protocol.
//!
//! - [`message`]: typed inbound/outbound messages and their wire form
//! - [`engine`]: the state machine that turns inbound messages into replies

pub mod engine;
pub mod message;

pub use engine::ProtocolEngine;
pub use message::{Inbound, Outbound, ProtocolError, StartRequest};
