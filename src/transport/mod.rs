//! Connection to the coordinator.
//!
//! - [`codec`]: multipart message framing over a byte stream
//! - [`channel`]: reconnecting, identity-tagged message channel
//!
//! The first message on every connection is a single frame carrying the
//! agent identity; everything after that is protocol traffic.

pub mod channel;
pub mod codec;

pub use channel::Channel;
pub use codec::{CodecError, MultipartCodec};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,
}
