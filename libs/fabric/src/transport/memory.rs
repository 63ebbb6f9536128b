use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier_core::Envelope;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::task::ListenerSlot;
use crate::transport::{InboundSink, Protocol};

/// In-process queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Same-process delivery through a bounded queue
///
/// `send` never blocks: a full queue is reported as `QueueFull`. Envelopes
/// left in the queue when the listener stops stay there.
pub struct MemoryProtocol {
    initialized: AtomicBool,
    tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    listener: ListenerSlot,
}

impl MemoryProtocol {
    pub fn new(config: MemoryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            initialized: AtomicBool::new(false),
            tx,
            rx: Arc::new(Mutex::new(rx)),
            listener: ListenerSlot::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(MemoryConfig { capacity })
    }

    /// Number of envelopes waiting in the queue
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl Default for MemoryProtocol {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait::async_trait]
impl Protocol for MemoryProtocol {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!(capacity = self.tx.max_capacity(), "memory protocol initialized");
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        self.tx.try_send(envelope.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ListenerClosed,
        })
    }

    async fn start_listening(&self, sink: InboundSink) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        let rx = self.rx.clone();
        self.listener
            .start("memory-listener", move |signal| async move {
                let mut rx = rx.lock().await;
                loop {
                    tokio::select! {
                        _ = signal.stopped() => break,
                        next = rx.recv() => {
                            let Some(envelope) = next else { break };
                            if sink.deliver(envelope).await.is_err() {
                                tracing::warn!("memory listener lost its sink, stopping");
                                break;
                            }
                        }
                    }
                }
            })
            .await
    }

    async fn stop_listening(&self) -> Result<()> {
        if self.listener.stop().await {
            tracing::debug!("memory listener stopped");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}
