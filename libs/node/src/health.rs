use std::sync::Arc;
use std::time::Duration;

use courier_fabric::BackgroundTask;
use futures::future::join_all;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::{Registration, Registry};

/// Periodically probes every available protocol and records the result
///
/// A protocol that fails a probe is skipped by selection until a later probe
/// succeeds; nothing is ever removed from the registry.
#[derive(Clone)]
pub(crate) struct HealthMonitor {
    registry: Arc<Registry>,
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// Probe every available protocol concurrently
    pub async fn probe_all(&self) {
        let probes = self
            .registry
            .available()
            .into_iter()
            .map(|registration| probe(registration, self.timeout));
        join_all(probes).await;
    }

    /// Run `probe_all` every interval until stopped; the first round is one
    /// interval from now.
    pub fn spawn(self) -> BackgroundTask {
        BackgroundTask::spawn("health-monitor", move |signal| async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = signal.stopped() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = signal.stopped() => break,
                    _ = self.probe_all() => {}
                }
            }
            debug!("health monitor stopped");
        })
    }
}

async fn probe(registration: Arc<Registration>, timeout: Duration) {
    let healthy = match tokio::time::timeout(timeout, registration.protocol.health_check()).await {
        Ok(healthy) => healthy,
        Err(_) => {
            debug!(protocol = %registration.name, ?timeout, "health check timed out");
            false
        }
    };

    let was_healthy = registration.set_health(healthy);
    match (was_healthy, healthy) {
        (true, false) => warn!(protocol = %registration.name, "protocol became unhealthy"),
        (false, true) => info!(protocol = %registration.name, "protocol is healthy"),
        _ => {}
    }
}
