use std::sync::Arc;

use courier_core::Envelope;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub mod file;
pub mod http;
pub mod memory;

pub use self::file::{FileConfig, FileProtocol};
pub use self::http::{HttpConfig, HttpProtocol};
pub use self::memory::{MemoryConfig, MemoryProtocol};

/// A delivery mechanism the fallback layer can route envelopes through
///
/// Implementations take their settings at construction, so `initialize` only
/// acquires resources. All methods take `&self`; a protocol is shared between
/// the sending path, its own listener and the health prober.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync {
    /// Short label for logs and status reports
    fn kind(&self) -> &'static str;

    /// Acquire directories, sockets or queues. Calling it twice is harmless.
    async fn initialize(&self) -> Result<()>;

    /// Make exactly one delivery attempt
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Start forwarding inbound envelopes into `sink`
    ///
    /// Allowed once per instance; later calls fail with `AlreadyListening`.
    async fn start_listening(&self, sink: InboundSink) -> Result<()>;

    /// Stop the listener and release its resources. Idempotent.
    async fn stop_listening(&self) -> Result<()>;

    /// Cheap reachability probe. Callers bound it with their own timeout.
    async fn health_check(&self) -> bool;
}

/// An envelope received by a protocol, tagged with where it came from
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: Arc<str>,
    pub envelope: Envelope,
}

/// Hand-off point between protocol listeners and the single consumer
///
/// Every listener gets its own clone tagged with the registration name; all
/// clones feed the same bounded queue.
#[derive(Debug, Clone)]
pub struct InboundSink {
    source: Arc<str>,
    tx: mpsc::Sender<Inbound>,
}

impl InboundSink {
    pub fn new(source: impl Into<Arc<str>>, tx: mpsc::Sender<Inbound>) -> Self {
        Self {
            source: source.into(),
            tx,
        }
    }

    /// Create a sink and the receiver it feeds
    pub fn channel(source: impl Into<Arc<str>>, capacity: usize) -> (Self, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(source, tx), rx)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Queue an envelope for dispatch, waiting while the queue is full
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(Inbound {
                source: self.source.clone(),
                envelope,
            })
            .await
            .map_err(|_| Error::ListenerClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
