use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{Envelope, MessageKind};
use courier_fabric::codec::{Format, JsonCodec};
use courier_fabric::{
    BackgroundTask, FileProtocol, HttpProtocol, InboundSink, MemoryProtocol, Protocol,
};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FallbackConfig, NodeConfig};
use crate::dispatch::{Dispatcher, HandlerSlot};
use crate::error::{Error, Result, SendError};
use crate::health::HealthMonitor;
use crate::registry::{FailureOutcome, ProtocolStatus, Registration, Registry};

/// Read-only snapshot of the manager for observability
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Protocol the next send would use
    pub active_protocol: Option<String>,
    /// Every registration, highest priority first
    pub protocols: Vec<ProtocolStatus>,
}

enum Lifecycle {
    Created,
    Starting,
    Running(Workers),
    Stopped,
}

struct Workers {
    monitor: BackgroundTask,
    dispatcher: BackgroundTask,
}

/// Count of sends currently executing, used to drain on shutdown
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no send is running, up to `grace`; returns whether it drained
    async fn drained(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.current() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Routes envelopes over the best available protocol and funnels inbound
/// traffic from all of them into one handler.
///
/// Protocols are registered before [`start`](Self::start). From then on the
/// Health Monitor and failing sends move protocols in and out of selection;
/// the highest-priority healthy one carries each attempt.
///
/// The manager is meant to be built once and shared as `Arc<FallbackManager>`.
/// Dropping it without [`stop`](Self::stop) still winds the background tasks
/// down, just without the drain.
pub struct FallbackManager {
    config: FallbackConfig,
    registry: Arc<Registry>,
    handler: HandlerSlot,
    lifecycle: Mutex<Lifecycle>,
    accepting: AtomicBool,
    in_flight: InFlight,
}

impl FallbackManager {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::default()),
            handler: Arc::new(Mutex::new(None)),
            lifecycle: Mutex::new(Lifecycle::Created),
            accepting: AtomicBool::new(false),
            in_flight: InFlight::default(),
        }
    }

    /// Build a manager with every protocol enabled in `config` registered
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let manager = Self::new(config.fallback.clone());
        let protocols = &config.protocols;

        if protocols.memory.enabled {
            let memory = MemoryProtocol::new(protocols.memory.settings.clone());
            manager.register_protocol("memory", protocols.memory.priority, Arc::new(memory))?;
        }

        if protocols.file.enabled {
            let settings = protocols.file_settings(&config.fallback.node_id);
            let file: Arc<dyn Protocol> = match settings.format {
                Format::Bincode => Arc::new(FileProtocol::new(settings)),
                Format::Json => Arc::new(FileProtocol::with_codec(settings, JsonCodec)),
            };
            manager.register_protocol("file", protocols.file.priority, file)?;
        }

        if protocols.http.enabled {
            let settings = protocols.http.settings.clone();
            let http: Arc<dyn Protocol> = match settings.format {
                Format::Bincode => Arc::new(HttpProtocol::new(settings)),
                Format::Json => Arc::new(HttpProtocol::with_codec(settings, JsonCodec)),
            };
            manager.register_protocol("http", protocols.http.priority, http)?;
        }

        Ok(manager)
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Add a protocol under a unique name and a unique priority
    ///
    /// Larger priorities are tried first. Only allowed before `start`.
    pub fn register_protocol(
        &self,
        name: impl Into<String>,
        priority: i32,
        protocol: Arc<dyn Protocol>,
    ) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(Error::AlreadyStarted);
        }

        let name = name.into();
        debug!(protocol = %name, kind = protocol.kind(), priority, "registering protocol");
        self.registry.insert(name, priority, protocol)
    }

    /// Install the inbound handler, replacing any previous one
    ///
    /// The handler runs on the dispatcher task, one envelope at a time. A
    /// replacement installed while it runs takes over from the next envelope.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Initialize protocols, probe them once, then start listening and monitoring
    ///
    /// Protocols that fail to initialize stay registered but are never used.
    #[tracing::instrument(skip_all, fields(node = %self.config.node_id))]
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Created) {
                return Err(Error::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }

        if self.registry.is_empty() {
            warn!("no protocol registered");
            *self.lifecycle.lock() = Lifecycle::Created;
            return Err(Error::NoProtocolInitialized);
        }

        let initialized = self.initialize_protocols().await;
        if initialized == 0 {
            *self.lifecycle.lock() = Lifecycle::Created;
            return Err(Error::NoProtocolInitialized);
        }

        let monitor = HealthMonitor::new(
            self.registry.clone(),
            self.config.health_check_interval(),
            self.config.health_check_timeout(),
        );
        monitor.probe_all().await;

        let (tx, rx) = mpsc::channel(self.config.dispatch_capacity.max(1));
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.handler.clone(),
            self.config.dedup_window(),
            rx,
        )
        .spawn();

        for registration in self.registry.available() {
            let sink = InboundSink::new(registration.name.as_str(), tx.clone());
            if let Err(e) = registration.protocol.start_listening(sink).await {
                warn!(protocol = %registration.name, error = %e, "listener failed to start, protocol can still send");
            }
        }
        drop(tx);

        let workers = Workers {
            monitor: monitor.spawn(),
            dispatcher,
        };
        *self.lifecycle.lock() = Lifecycle::Running(workers);
        self.accepting.store(true, Ordering::SeqCst);

        info!(
            protocols = initialized,
            active = ?self.registry.select().map(|r| r.name.clone()),
            "fallback manager started"
        );
        Ok(())
    }

    async fn initialize_protocols(&self) -> usize {
        let timeout = self.config.send_timeout();
        let attempts = self.registry.all().into_iter().map(|registration| async move {
            match tokio::time::timeout(timeout, registration.protocol.initialize()).await {
                Ok(Ok(())) => {
                    registration.set_available(true);
                    debug!(protocol = %registration.name, "protocol initialized");
                    true
                }
                Ok(Err(e)) => {
                    warn!(protocol = %registration.name, error = %e, "protocol failed to initialize");
                    false
                }
                Err(_) => {
                    warn!(protocol = %registration.name, ?timeout, "protocol initialization timed out");
                    false
                }
            }
        });

        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    /// Deliver an envelope through the best protocol, retrying and switching
    /// on failure
    ///
    /// Only terminal outcomes are returned. Every attempt re-runs selection,
    /// so a protocol demoted by repeated failures is skipped at once.
    pub async fn send(&self, mut envelope: Envelope) -> std::result::Result<(), SendError> {
        let _guard = self.in_flight.enter();
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SendError::NotRunning);
        }

        if envelope.ttl_seconds.is_none() {
            envelope.ttl_seconds = self.config.default_ttl_secs;
        }

        let id = envelope.id();
        let max_retries = self.config.max_retries;
        if envelope.retry_count() >= max_retries {
            warn!(msg_id = %id, retry_count = envelope.retry_count(), "retry budget already spent");
            return Err(SendError::RetriesExhausted { id, max_retries });
        }

        let mut attempts = 0u32;
        let mut last_failed: Option<Arc<Registration>> = None;

        loop {
            if envelope.is_expired() {
                warn!(msg_id = %id, attempts, "message expired before delivery");
                return Err(SendError::Expired { id });
            }

            let Some(registration) = self.pick(last_failed.as_ref()) else {
                warn!(msg_id = %id, attempts, "no protocol available");
                return Err(SendError::NoProtocolAvailable);
            };

            attempts += 1;
            let error = match self.attempt(&registration, &envelope).await {
                Ok(()) => {
                    registration.record_sent();
                    debug!(
                        msg_id = %id,
                        protocol = %registration.name,
                        priority = %envelope.priority,
                        attempts,
                        "message sent"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if registration.record_failure(self.config.failure_threshold) == FailureOutcome::Demoted {
                warn!(
                    protocol = %registration.name,
                    threshold = self.config.failure_threshold,
                    "protocol demoted after consecutive send failures"
                );
            }

            let retry_count = envelope.record_retry();
            if retry_count >= max_retries {
                warn!(msg_id = %id, protocol = %registration.name, error = %error, attempts, "delivery failed");
                return Err(SendError::DeliveryFailed {
                    id,
                    attempts,
                    last_error: format!("{}: {}", registration.name, error),
                });
            }

            debug!(msg_id = %id, protocol = %registration.name, error = %error, retry_count, "send failed, retrying");
            last_failed = Some(registration);

            let backoff = self.config.retry_backoff();
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// Selection for the next attempt
    ///
    /// Normally the best healthy protocol. When the only available protocol
    /// just failed and got demoted, it is retried anyway so single-transport
    /// deployments ride out transient failures.
    fn pick(&self, last_failed: Option<&Arc<Registration>>) -> Option<Arc<Registration>> {
        if let Some(selected) = self.registry.select() {
            return Some(selected);
        }

        let last = last_failed?;
        let available = self.registry.available();
        if available.len() == 1 && Arc::ptr_eq(&available[0], last) {
            return Some(last.clone());
        }
        None
    }

    async fn attempt(&self, registration: &Registration, envelope: &Envelope) -> courier_fabric::Result<()> {
        match tokio::time::timeout(self.config.send_timeout(), registration.protocol.send(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(courier_fabric::Error::Timeout("Send")),
        }
    }

    /// Build an envelope from this node and send it, returning its id
    pub async fn send_to(
        &self,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<Vec<u8>>,
    ) -> std::result::Result<Uuid, SendError> {
        let envelope = Envelope::new(self.config.node_id.clone(), recipient, kind, payload);
        let id = envelope.id();
        self.send(envelope).await.map(|()| id)
    }

    pub fn status(&self) -> Status {
        let protocols = self.registry.statuses();
        let active_protocol = protocols
            .iter()
            .find(|p| p.available && p.healthy)
            .map(|p| p.name.clone());

        Status {
            active_protocol,
            protocols,
        }
    }

    /// Stop monitoring and listening, let running sends finish, then stop
    /// dispatching
    ///
    /// Every step is bounded by the shutdown grace. Calling it again, or on a
    /// manager that never started, does nothing.
    #[tracing::instrument(skip_all, fields(node = %self.config.node_id))]
    pub async fn stop(&self) {
        let workers = {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Running(_)) {
                return;
            }
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(workers) => workers,
                _ => return,
            }
        };

        info!("stopping fallback manager");
        self.accepting.store(false, Ordering::SeqCst);
        let grace = self.config.shutdown_grace();

        workers.monitor.stop(grace).await;

        for registration in self.registry.available() {
            match tokio::time::timeout(grace, registration.protocol.stop_listening()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(protocol = %registration.name, error = %e, "stop_listening failed"),
                Err(_) => warn!(protocol = %registration.name, "stop_listening timed out"),
            }
        }

        if !self.in_flight.drained(grace).await {
            warn!(in_flight = self.in_flight.current(), "shutdown grace elapsed with sends still running");
        }

        workers.dispatcher.stop(grace).await;
        info!("fallback manager stopped");
    }
}
