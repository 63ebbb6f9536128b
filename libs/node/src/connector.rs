use std::fmt::Display;
use std::sync::Arc;

use courier_core::Envelope;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::manager::FallbackManager;

/// The normal delivery path of an application, e.g. a broker client
#[async_trait::async_trait]
pub trait PrimaryTransport: Send + Sync {
    type Error: Display + Send;

    async fn publish(&self, envelope: &Envelope) -> Result<(), Self::Error>;
}

/// Which path carried a published envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

/// Publishes through the primary transport and falls back to the manager
/// when it fails
pub struct Connector<P> {
    primary: P,
    fallback: Arc<FallbackManager>,
}

impl<P: PrimaryTransport> Connector<P> {
    pub fn new(primary: P, fallback: Arc<FallbackManager>) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    pub async fn publish(&self, envelope: Envelope) -> Result<Route, SendError> {
        match self.primary.publish(&envelope).await {
            Ok(()) => Ok(Route::Primary),
            Err(e) => {
                warn!(msg_id = %envelope.id(), error = %e, "primary publish failed, using fallback");
                self.fallback.send(envelope).await?;
                Ok(Route::Fallback)
            }
        }
    }

    /// Feed envelopes received over the fallback path into `handler` as `M`
    ///
    /// Envelopes `convert` rejects are dropped.
    pub fn on_fallback_message<M, C, H>(&self, convert: C, mut handler: H)
    where
        C: Fn(Envelope) -> Option<M> + Send + 'static,
        H: FnMut(M) + Send + 'static,
    {
        self.fallback.on_message(move |envelope| {
            let id = envelope.id();
            match convert(envelope) {
                Some(message) => handler(message),
                None => debug!(msg_id = %id, "fallback message not convertible, dropping"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use courier_core::MessageKind;
    use courier_fabric::MemoryProtocol;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::FallbackConfig;

    #[derive(Default)]
    struct Broker {
        down: AtomicBool,
        published: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PrimaryTransport for Arc<Broker> {
        type Error = String;

        async fn publish(&self, _envelope: &Envelope) -> Result<(), String> {
            if self.down.load(Ordering::SeqCst) {
                return Err("broker unreachable".into());
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn started_manager() -> Arc<FallbackManager> {
        let manager = FallbackManager::new(FallbackConfig {
            node_id: "node-a".into(),
            ..Default::default()
        });
        manager
            .register_protocol("memory", 1, Arc::new(MemoryProtocol::default()))
            .unwrap();
        manager.start().await.unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn prefers_primary() {
        let broker = Arc::new(Broker::default());
        let connector = Connector::new(broker.clone(), started_manager().await);

        let envelope = Envelope::new("node-a", "node-b", MessageKind::Event, b"hi".to_vec());
        assert_eq!(connector.publish(envelope).await.unwrap(), Route::Primary);
        assert_eq!(broker.published.load(Ordering::SeqCst), 1);

        connector.fallback().stop().await;
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let broker = Arc::new(Broker::default());
        broker.down.store(true, Ordering::SeqCst);
        let connector = Connector::new(broker.clone(), started_manager().await);

        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.on_fallback_message(
            |envelope| String::from_utf8(envelope.payload).ok(),
            move |text: String| {
                let _ = tx.send(text);
            },
        );

        let envelope = Envelope::new("node-a", "node-a", MessageKind::Event, b"hello".to_vec());
        assert_eq!(connector.publish(envelope).await.unwrap(), Route::Fallback);
        assert_eq!(broker.published.load(Ordering::SeqCst), 0);

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "hello");

        connector.fallback().stop().await;
    }

    #[tokio::test]
    async fn surfaces_fallback_failure() {
        let broker = Arc::new(Broker::default());
        broker.down.store(true, Ordering::SeqCst);
        let manager = Arc::new(FallbackManager::new(FallbackConfig::default()));
        let connector = Connector::new(broker, manager);

        let envelope = Envelope::new("node-a", "node-b", MessageKind::Event, Vec::new());
        assert_eq!(connector.publish(envelope).await, Err(SendError::NotRunning));
    }
}
