//! Courier Core - message envelope shared by every transport
//!
//! An [`Envelope`] wraps an opaque payload with addressing, priority, TTL and
//! retry metadata. Transports serialize it whole; nothing below the
//! application looks inside the payload.

pub mod envelope;
pub mod error;

pub use envelope::{validate_address, Envelope, MessageKind, Priority, BROADCAST};
pub use error::{Error, Result};
