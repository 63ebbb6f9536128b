use courier_core::{Envelope, MessageKind};
use courier_fabric::{
    error::{Error as ProtocolError, Result as ProtocolResult},
    FileConfig, FileProtocol, HttpConfig, HttpProtocol, Inbound, InboundSink, MemoryProtocol,
    Protocol,
};
use courier_node::{Error, FallbackConfig, FallbackManager, NodeConfig, SendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Protocol whose behaviour the test flips at runtime
struct Scripted {
    healthy: AtomicBool,
    fail_init: AtomicBool,
    fail_sends: AtomicBool,
    hang_sends: AtomicBool,
    hang_health: AtomicBool,
    attempts: AtomicUsize,
    sent: Mutex<Vec<Envelope>>,
    sink: Mutex<Option<InboundSink>>,
    stops: AtomicUsize,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            fail_init: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            hang_sends: AtomicBool::new(false),
            hang_health: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            stops: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        let protocol = Self::new();
        protocol.fail_sends.store(true, Ordering::SeqCst);
        protocol
    }

    fn unhealthy() -> Arc<Self> {
        let protocol = Self::new();
        protocol.healthy.store(false, Ordering::SeqCst);
        protocol
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Push an envelope into the manager as if it arrived over this protocol
    async fn inject(&self, envelope: Envelope) {
        let sink = self.sink.lock().clone().expect("protocol is not listening");
        sink.deliver(envelope).await.unwrap();
    }
}

#[async_trait::async_trait]
impl Protocol for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn initialize(&self) -> ProtocolResult<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(ProtocolError::Config("scripted init failure".into()));
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> ProtocolResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang_sends.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Custom("scripted send failure".into()));
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }

    async fn start_listening(&self, sink: InboundSink) -> ProtocolResult<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop_listening(&self) -> ProtocolResult<()> {
        self.sink.lock().take();
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.hang_health.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.healthy.load(Ordering::SeqCst)
    }
}

fn test_config() -> FallbackConfig {
    FallbackConfig {
        node_id: "node-a".into(),
        // Long enough that only the start-up probe runs during a test
        health_check_interval_ms: 60_000,
        retry_backoff_ms: 10,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

fn envelope(payload: &[u8]) -> Envelope {
    Envelope::new("node-a", "node-b", MessageKind::Event, payload.to_vec())
}

/// Route every handled envelope into a channel the test can await
fn collect(manager: &FallbackManager) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on_message(move |envelope| {
        let _ = tx.send(envelope);
    });
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}

/// Poll the status until `expected` is the active protocol
async fn wait_for_active(manager: &FallbackManager, expected: Option<&str>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let active = manager.status().active_protocol;
        if active.as_deref() == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("active protocol stayed {active:?}, expected {expected:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// Selection and fallback

#[tokio::test]
async fn network_preferred_when_everything_is_healthy() {
    let dir = tempfile::tempdir().unwrap();

    let receiver = HttpProtocol::new(HttpConfig::new("127.0.0.1:0"));
    receiver.initialize().await.unwrap();
    let (sink, mut inbound) = InboundSink::channel("http", 16);
    receiver.start_listening(sink).await.unwrap();
    let peer = receiver.endpoint().unwrap();

    let manager = FallbackManager::new(test_config());
    let network = HttpProtocol::new(HttpConfig::new("127.0.0.1:0").with_peer(peer));
    let file = FileProtocol::new(FileConfig::new(dir.path(), "node-a"));
    manager.register_protocol("network", 3, Arc::new(network)).unwrap();
    manager.register_protocol("file", 2, Arc::new(file)).unwrap();
    manager.register_protocol("memory", 1, Arc::new(MemoryProtocol::default())).unwrap();
    manager.start().await.unwrap();

    assert_eq!(manager.status().active_protocol.as_deref(), Some("network"));

    let env = envelope(b"over the wire");
    manager.send(env.clone()).await.unwrap();

    let Inbound { envelope, .. } = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.id(), env.id());
    assert_eq!(envelope.payload, b"over the wire");

    let status = manager.status();
    let network = status.protocols.iter().find(|p| p.name == "network").unwrap();
    assert_eq!(network.stats.sent, 1);
    let file = status.protocols.iter().find(|p| p.name == "file").unwrap();
    assert_eq!(file.stats.sent, 0);
    assert!(!dir.path().join("node-b").exists());

    manager.stop().await;
    receiver.stop_listening().await.unwrap();
}

#[tokio::test]
async fn repeated_send_failures_demote_protocol() {
    let manager = FallbackManager::new(FallbackConfig {
        failure_threshold: 2,
        max_retries: 3,
        ..test_config()
    });
    let network = Scripted::failing();
    let file = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.register_protocol("file", 2, file.clone()).unwrap();
    manager.start().await.unwrap();

    // Health probes still report the network protocol as fine
    assert_eq!(manager.status().active_protocol.as_deref(), Some("network"));

    manager.send(envelope(b"first")).await.unwrap();
    assert_eq!(network.attempts(), 2);
    assert_eq!(file.sent().len(), 1);
    assert_eq!(file.sent()[0].retry_count(), 2);

    let status = manager.status();
    assert_eq!(status.active_protocol.as_deref(), Some("file"));
    let network_status = status.protocols.iter().find(|p| p.name == "network").unwrap();
    assert!(!network_status.healthy);
    assert_eq!(network_status.stats.send_failures, 2);

    // No more attempts on the demoted protocol
    manager.send(envelope(b"second")).await.unwrap();
    assert_eq!(network.attempts(), 2);
    assert_eq!(file.sent().len(), 2);

    manager.stop().await;
}

#[tokio::test]
async fn failure_below_threshold_keeps_protocol_selected() {
    let manager = FallbackManager::new(FallbackConfig {
        failure_threshold: 2,
        retry_backoff_ms: 300,
        ..test_config()
    });
    let network = Scripted::new();
    let file = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.register_protocol("file", 2, file.clone()).unwrap();
    manager.start().await.unwrap();

    // One failure on network, then recover it during the backoff
    network.fail_sends.store(true, Ordering::SeqCst);
    let sending = manager.send(envelope(b"x"));
    tokio::pin!(sending);
    tokio::select! {
        _ = &mut sending => panic!("send finished too early"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }
    network.fail_sends.store(false, Ordering::SeqCst);
    sending.await.unwrap();

    assert_eq!(network.attempts(), 2);
    assert_eq!(network.sent().len(), 1);
    assert_eq!(file.attempts(), 0);
    assert_eq!(manager.status().active_protocol.as_deref(), Some("network"));

    manager.stop().await;
}

#[tokio::test]
async fn expired_envelope_never_reaches_a_protocol() {
    let manager = FallbackManager::new(test_config());
    let network = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.start().await.unwrap();

    let env = envelope(b"stale").with_ttl(1);
    let id = env.id();
    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(manager.send(env).await, Err(SendError::Expired { id }));
    assert_eq!(network.attempts(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn all_unhealthy_fails_immediately() {
    let manager = FallbackManager::new(test_config());
    let protocols = [Scripted::unhealthy(), Scripted::unhealthy(), Scripted::unhealthy()];
    for (i, protocol) in protocols.iter().enumerate() {
        manager
            .register_protocol(format!("p{i}"), i as i32, protocol.clone())
            .unwrap();
    }
    manager.start().await.unwrap();

    assert_eq!(manager.status().active_protocol, None);
    assert_eq!(
        manager.send(envelope(b"nowhere")).await,
        Err(SendError::NoProtocolAvailable)
    );
    assert!(protocols.iter().all(|p| p.attempts() == 0));

    manager.stop().await;
}

#[tokio::test]
async fn exhausted_envelope_is_not_retried() {
    let manager = FallbackManager::new(FallbackConfig {
        max_retries: 3,
        ..test_config()
    });
    let network = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.start().await.unwrap();

    let mut env = envelope(b"tired");
    for _ in 0..3 {
        env.record_retry();
    }
    let id = env.id();

    assert_eq!(
        manager.send(env).await,
        Err(SendError::RetriesExhausted { id, max_retries: 3 })
    );
    assert_eq!(network.attempts(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn single_protocol_retries_until_budget_spent() {
    let manager = FallbackManager::new(FallbackConfig {
        max_retries: 3,
        failure_threshold: 2,
        ..test_config()
    });
    let only = Scripted::failing();
    manager.register_protocol("only", 1, only.clone()).unwrap();
    manager.start().await.unwrap();

    let env = envelope(b"doomed");
    let id = env.id();
    match manager.send(env).await {
        Err(SendError::DeliveryFailed { id: failed, attempts, last_error }) => {
            assert_eq!(failed, id);
            assert_eq!(attempts, 3);
            assert!(last_error.contains("only"));
            assert!(last_error.contains("scripted send failure"));
        }
        other => panic!("Expected DeliveryFailed, got {:?}", other),
    }
    assert_eq!(only.attempts(), 3);

    manager.stop().await;
}

#[tokio::test]
async fn hung_send_is_bounded_by_send_timeout() {
    let manager = FallbackManager::new(FallbackConfig {
        max_retries: 1,
        send_timeout_ms: 100,
        ..test_config()
    });
    let slow = Scripted::new();
    slow.hang_sends.store(true, Ordering::SeqCst);
    manager.register_protocol("slow", 1, slow.clone()).unwrap();
    manager.start().await.unwrap();

    let started = std::time::Instant::now();
    match manager.send(envelope(b"slow")).await {
        Err(SendError::DeliveryFailed { attempts: 1, last_error, .. }) => {
            assert!(last_error.contains("timeout"));
        }
        other => panic!("Expected DeliveryFailed, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    manager.stop().await;
}

#[tokio::test]
async fn default_ttl_applied_to_envelopes_without_one() {
    let manager = FallbackManager::new(FallbackConfig {
        default_ttl_secs: Some(60),
        ..test_config()
    });
    let network = Scripted::new();
    manager.register_protocol("network", 1, network.clone()).unwrap();
    manager.start().await.unwrap();

    manager.send(envelope(b"a")).await.unwrap();
    manager.send(envelope(b"b").with_ttl(5)).await.unwrap();

    let sent = network.sent();
    assert_eq!(sent[0].ttl_seconds, Some(60));
    assert_eq!(sent[1].ttl_seconds, Some(5));

    manager.stop().await;
}

// Health monitoring

#[tokio::test]
async fn failed_health_check_removes_protocol_until_recovery() {
    let manager = FallbackManager::new(FallbackConfig {
        health_check_interval_ms: 100,
        ..test_config()
    });
    let network = Scripted::new();
    let file = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.register_protocol("file", 2, file.clone()).unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.status().active_protocol.as_deref(), Some("network"));

    network.healthy.store(false, Ordering::SeqCst);
    wait_for_active(&manager, Some("file")).await;

    manager.send(envelope(b"during outage")).await.unwrap();
    assert_eq!(network.attempts(), 0);
    assert_eq!(file.sent().len(), 1);

    network.healthy.store(true, Ordering::SeqCst);
    wait_for_active(&manager, Some("network")).await;

    manager.send(envelope(b"recovered")).await.unwrap();
    assert_eq!(network.sent().len(), 1);
    assert_eq!(file.sent().len(), 1);

    let status = manager.status();
    let network_status = status.protocols.iter().find(|p| p.name == "network").unwrap();
    assert!(network_status.healthy);
    assert!(network_status.checked_at.is_some());

    manager.stop().await;
}

#[tokio::test]
async fn health_recovery_clears_send_failure_demotion() {
    let manager = FallbackManager::new(FallbackConfig {
        health_check_interval_ms: 100,
        failure_threshold: 1,
        max_retries: 2,
        ..test_config()
    });
    let network = Scripted::failing();
    let file = Scripted::new();
    manager.register_protocol("network", 3, network.clone()).unwrap();
    manager.register_protocol("file", 2, file.clone()).unwrap();
    manager.start().await.unwrap();

    manager.send(envelope(b"demotes")).await.unwrap();
    assert_eq!(network.attempts(), 1);

    // Health checks keep passing, so the next round brings it back
    network.fail_sends.store(false, Ordering::SeqCst);
    wait_for_active(&manager, Some("network")).await;

    let status = manager.status();
    let network_status = status.protocols.iter().find(|p| p.name == "network").unwrap();
    assert_eq!(network_status.stats.consecutive_failures, 0);

    manager.send(envelope(b"back")).await.unwrap();
    assert_eq!(network.sent().len(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn slow_health_check_counts_as_unhealthy() {
    let manager = FallbackManager::new(FallbackConfig {
        health_check_interval_ms: 100,
        health_check_timeout_ms: 100,
        ..test_config()
    });
    let slow = Scripted::new();
    slow.hang_health.store(true, Ordering::SeqCst);
    let ok = Scripted::new();
    manager.register_protocol("slow", 2, slow.clone()).unwrap();
    manager.register_protocol("ok", 1, ok.clone()).unwrap();

    let started = std::time::Instant::now();
    manager.start().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.status().active_protocol.as_deref(), Some("ok"));

    manager.send(envelope(b"x")).await.unwrap();
    assert_eq!(slow.attempts(), 0);
    assert_eq!(ok.sent().len(), 1);

    slow.hang_health.store(false, Ordering::SeqCst);
    wait_for_active(&manager, Some("slow")).await;

    manager.stop().await;
}

// Receive path

#[tokio::test]
async fn file_roundtrip_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FallbackManager::new(test_config());
    let file = FileProtocol::new(FileConfig {
        poll_interval_ms: 20,
        ..FileConfig::new(dir.path(), "node-a")
    });
    manager.register_protocol("file", 1, Arc::new(file)).unwrap();
    let mut handled = collect(&manager);
    manager.start().await.unwrap();

    let id = manager
        .send_to("node-a", MessageKind::Request, b"to myself".to_vec())
        .await
        .unwrap();

    let received = next(&mut handled).await;
    assert_eq!(received.id(), id);
    assert_eq!(received.sender, "node-a");
    assert_eq!(received.recipient, "node-a");
    assert_eq!(received.kind, MessageKind::Request);
    assert_eq!(received.payload, b"to myself");

    let status = manager.status();
    assert_eq!(status.protocols[0].stats.sent, 1);
    assert_eq!(status.protocols[0].stats.received, 1);

    manager.stop().await;
}

#[tokio::test]
async fn duplicates_across_protocols_reach_handler_once() {
    let manager = FallbackManager::new(test_config());
    let a = Scripted::new();
    let b = Scripted::new();
    manager.register_protocol("a", 2, a.clone()).unwrap();
    manager.register_protocol("b", 1, b.clone()).unwrap();
    let mut handled = collect(&manager);
    manager.start().await.unwrap();

    let env = envelope(b"twice");
    a.inject(env.clone()).await;
    b.inject(env.clone()).await;
    let other = envelope(b"other");
    b.inject(other.clone()).await;

    assert_eq!(next(&mut handled).await.id(), env.id());
    assert_eq!(next(&mut handled).await.id(), other.id());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handled.try_recv().is_err());

    // Both copies still count as received by their protocol
    let status = manager.status();
    assert!(status.protocols.iter().all(|p| p.stats.received >= 1));

    manager.stop().await;
}

#[tokio::test]
async fn expired_inbound_is_dropped() {
    let manager = FallbackManager::new(test_config());
    let a = Scripted::new();
    manager.register_protocol("a", 1, a.clone()).unwrap();
    let mut handled = collect(&manager);
    manager.start().await.unwrap();

    let stale = envelope(b"stale").with_ttl(0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.inject(stale).await;
    let fresh = envelope(b"fresh");
    a.inject(fresh.clone()).await;

    assert_eq!(next(&mut handled).await.id(), fresh.id());

    manager.stop().await;
}

#[tokio::test]
async fn replacing_handler_routes_to_latest() {
    let manager = FallbackManager::new(test_config());
    let a = Scripted::new();
    manager.register_protocol("a", 1, a.clone()).unwrap();
    let mut first = collect(&manager);
    manager.start().await.unwrap();

    let one = envelope(b"one");
    a.inject(one.clone()).await;
    assert_eq!(next(&mut first).await.id(), one.id());

    let mut second = collect(&manager);
    let two = envelope(b"two");
    a.inject(two.clone()).await;
    assert_eq!(next(&mut second).await.id(), two.id());
    assert!(first.try_recv().is_err());

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacing_handler_does_not_wait_for_running_one() {
    let manager = FallbackManager::new(test_config());
    let a = Scripted::new();
    manager.register_protocol("a", 1, a.clone()).unwrap();

    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let (first_tx, mut first) = mpsc::unbounded_channel();
    manager.on_message(move |envelope| {
        let _ = entered_tx.send(());
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        let _ = first_tx.send(envelope);
    });
    manager.start().await.unwrap();

    let one = envelope(b"one");
    a.inject(one.clone()).await;
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    // The first handler is still blocked inside the dispatcher
    let started = std::time::Instant::now();
    let mut second = collect(&manager);
    assert!(started.elapsed() < Duration::from_secs(1));

    release_tx.send(()).unwrap();
    assert_eq!(next(&mut first).await.id(), one.id());

    let two = envelope(b"two");
    a.inject(two.clone()).await;
    assert_eq!(next(&mut second).await.id(), two.id());
    assert!(first.try_recv().is_err());

    manager.stop().await;
}

// Lifecycle

#[tokio::test]
async fn registration_rules() {
    let manager = FallbackManager::new(test_config());
    manager.register_protocol("a", 1, Scripted::new()).unwrap();

    assert!(matches!(
        manager.register_protocol("a", 2, Scripted::new()),
        Err(Error::DuplicateName(name)) if name == "a"
    ));
    assert!(matches!(
        manager.register_protocol("b", 1, Scripted::new()),
        Err(Error::DuplicatePriority { priority: 1, .. })
    ));

    manager.start().await.unwrap();
    assert!(matches!(
        manager.register_protocol("c", 5, Scripted::new()),
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));

    manager.stop().await;
}

#[tokio::test]
async fn start_requires_one_initialized_protocol() {
    let empty = FallbackManager::new(test_config());
    assert!(matches!(empty.start().await, Err(Error::NoProtocolInitialized)));

    let manager = FallbackManager::new(test_config());
    let broken = Scripted::new();
    broken.fail_init.store(true, Ordering::SeqCst);
    manager.register_protocol("broken", 1, broken.clone()).unwrap();
    assert!(matches!(manager.start().await, Err(Error::NoProtocolInitialized)));
    assert!(!manager.is_running());
    assert_eq!(
        manager.send(envelope(b"x")).await,
        Err(SendError::NotRunning)
    );
}

#[tokio::test]
async fn failed_initialization_isolated_to_its_protocol() {
    let manager = FallbackManager::new(test_config());
    let broken = Scripted::new();
    broken.fail_init.store(true, Ordering::SeqCst);
    let working = Scripted::new();
    manager.register_protocol("broken", 2, broken.clone()).unwrap();
    manager.register_protocol("working", 1, working.clone()).unwrap();
    manager.start().await.unwrap();

    let status = manager.status();
    assert_eq!(status.active_protocol.as_deref(), Some("working"));
    let broken_status = status.protocols.iter().find(|p| p.name == "broken").unwrap();
    assert!(!broken_status.available);

    manager.send(envelope(b"x")).await.unwrap();
    assert_eq!(broken.attempts(), 0);
    assert_eq!(working.sent().len(), 1);

    manager.stop().await;
    assert_eq!(broken.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_is_final_and_idempotent() {
    let manager = FallbackManager::new(test_config());
    let a = Scripted::new();
    manager.register_protocol("a", 1, a.clone()).unwrap();
    manager.start().await.unwrap();
    assert!(manager.is_running());

    manager.stop().await;
    manager.stop().await;

    assert!(!manager.is_running());
    assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.send(envelope(b"late")).await,
        Err(SendError::NotRunning)
    );
    assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));
}

#[tokio::test]
async fn stop_waits_for_running_sends() {
    let manager = Arc::new(FallbackManager::new(FallbackConfig {
        send_timeout_ms: 300,
        max_retries: 1,
        shutdown_grace_ms: 2000,
        ..test_config()
    }));
    let slow = Scripted::new();
    slow.hang_sends.store(true, Ordering::SeqCst);
    manager.register_protocol("slow", 1, slow.clone()).unwrap();
    manager.start().await.unwrap();

    let sending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.send(envelope(b"slow")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.stop().await;
    assert!(sending.is_finished());
    assert!(matches!(
        sending.await.unwrap(),
        Err(SendError::DeliveryFailed { attempts: 1, .. })
    ));
}

#[tokio::test]
async fn status_serializes() {
    let manager = FallbackManager::new(test_config());
    manager.register_protocol("a", 1, Scripted::new()).unwrap();
    manager.start().await.unwrap();

    let value = serde_json::to_value(manager.status()).unwrap();
    assert_eq!(value["active_protocol"], "a");
    assert_eq!(value["protocols"][0]["kind"], "scripted");
    assert_eq!(value["protocols"][0]["healthy"], true);
    assert!(value["protocols"][0]["checked_at"].is_string());

    manager.stop().await;
}

#[tokio::test]
async fn built_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let toml_str = format!(
        r#"
        [fallback]
        node_id = "node-a"
        health_check_interval_ms = 60000

        [protocols.file]
        base_dir = "{}"
        poll_interval_ms = 20

        [protocols.http]
        enabled = false
        "#,
        dir.path().display()
    );
    let config = NodeConfig::from_toml_str(&toml_str).unwrap();
    let manager = FallbackManager::from_config(&config).unwrap();
    let mut handled = collect(&manager);
    manager.start().await.unwrap();

    let status = manager.status();
    let names: Vec<&str> = status.protocols.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["file", "memory"]);
    assert_eq!(status.active_protocol.as_deref(), Some("file"));

    let id = manager
        .send_to("node-a", MessageKind::Event, b"configured".to_vec())
        .await
        .unwrap();
    assert_eq!(next(&mut handled).await.id(), id);
    assert!(dir.path().join("node-a").join("inbox").is_dir());

    manager.stop().await;
}

#[tokio::test]
async fn http_enabled_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::default();
    config.fallback = test_config();
    config.protocols.file.settings.base_dir = dir.path().to_path_buf();
    config.protocols.http.settings.listen_addr = "127.0.0.1:0".into();

    let manager = FallbackManager::from_config(&config).unwrap();
    manager.start().await.unwrap();

    // No peer configured, so the listener alone makes it healthy
    assert_eq!(manager.status().active_protocol.as_deref(), Some("http"));
    assert_eq!(manager.status().protocols.len(), 3);

    manager.stop().await;
}
