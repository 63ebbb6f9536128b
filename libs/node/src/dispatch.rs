use std::sync::Arc;
use std::time::Duration;

use courier_core::Envelope;
use courier_fabric::{BackgroundTask, Inbound};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dedup::DedupWindow;
use crate::registry::Registry;

/// Callback receiving every inbound envelope, one at a time
pub type MessageHandler = Box<dyn FnMut(Envelope) + Send>;

pub(crate) type HandlerSlot = Arc<Mutex<Option<MessageHandler>>>;

/// Single consumer of the inbound queue all protocol listeners feed
///
/// Drops expired envelopes and repeats of recently seen ids, then calls the
/// registered handler. Only this task ever calls the handler.
pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    handler: HandlerSlot,
    dedup: DedupWindow,
    rx: mpsc::Receiver<Inbound>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        handler: HandlerSlot,
        dedup_window: Duration,
        rx: mpsc::Receiver<Inbound>,
    ) -> Self {
        Self {
            registry,
            handler,
            dedup: DedupWindow::new(dedup_window),
            rx,
        }
    }

    fn dispatch(&mut self, inbound: Inbound) {
        let Inbound { source, envelope } = inbound;

        if let Some(registration) = self.registry.get(&source) {
            registration.record_received();
        }

        if envelope.is_expired() {
            debug!(protocol = %source, msg_id = %envelope.id(), "dropping expired inbound message");
            return;
        }

        if !self.dedup.first_sighting(envelope.id(), Instant::now()) {
            debug!(protocol = %source, msg_id = %envelope.id(), "suppressing duplicate message");
            return;
        }

        debug!(
            protocol = %source,
            msg_id = %envelope.id(),
            sender = %envelope.sender,
            kind = %envelope.kind,
            tracked = self.dedup.len(),
            "dispatching inbound message"
        );

        // Run the handler outside the lock so `on_message` never waits on it
        let taken = self.handler.lock().take();
        let Some(mut handler) = taken else {
            warn!(msg_id = %envelope.id(), "no message handler registered, dropping");
            return;
        };

        handler(envelope);

        let mut slot = self.handler.lock();
        if slot.is_none() {
            *slot = Some(handler);
        }
    }

    /// Consume until stopped, then flush whatever is already queued
    pub fn spawn(mut self) -> BackgroundTask {
        BackgroundTask::spawn("dispatcher", move |signal| async move {
            loop {
                tokio::select! {
                    _ = signal.stopped() => break,
                    next = self.rx.recv() => match next {
                        Some(inbound) => self.dispatch(inbound),
                        None => break,
                    },
                }
            }

            while let Ok(inbound) = self.rx.try_recv() {
                self.dispatch(inbound);
            }
            debug!("dispatcher stopped");
        })
    }
}
