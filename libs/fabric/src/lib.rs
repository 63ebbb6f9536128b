//! Courier Fabric - interchangeable delivery protocols
//!
//! Provides the [`Protocol`] capability (initialize, send, listen, stop,
//! health check), three implementations of it and the codecs they use to put
//! envelopes on disk or on the wire.
//!
//! | protocol | reach | medium |
//! |----------|-------|--------|
//! | [`MemoryProtocol`] | same process | bounded queue |
//! | [`FileProtocol`] | same host | mailbox directories |
//! | [`HttpProtocol`] | cross host | HTTP POST |
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Envelope, MessageKind};
//! use courier_fabric::{FileConfig, FileProtocol, InboundSink, Protocol};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let protocol = FileProtocol::new(FileConfig::new("/tmp/courier", "alpha"));
//! protocol.initialize().await?;
//!
//! let (sink, mut inbound) = InboundSink::channel("file", 64);
//! protocol.start_listening(sink).await?;
//!
//! let envelope = Envelope::new("alpha", "alpha", MessageKind::Event, b"hello".to_vec());
//! protocol.send(&envelope).await?;
//!
//! let received = inbound.recv().await.unwrap();
//! assert_eq!(received.envelope, envelope);
//! protocol.stop_listening().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod task;
pub mod transport;

// Re-exports for convenience
pub use error::{Error, Result};
pub use task::{BackgroundTask, StopSignal};
pub use transport::{
    FileConfig, FileProtocol, HttpConfig, HttpProtocol, Inbound, InboundSink, MemoryConfig,
    MemoryProtocol, Protocol,
};
