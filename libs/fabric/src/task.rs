use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Time a listener gets to wind down before it is aborted
pub const LISTENER_STOP_GRACE: Duration = Duration::from_secs(2);

/// A background task's view of its stop request
#[derive(Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once a stop has been requested or the task handle is gone
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// A spawned tokio task that can be asked to stop
///
/// The task body receives a [`StopSignal`] and is expected to return soon
/// after it fires. [`BackgroundTask::stop`] aborts it if it does not.
/// Dropping the handle also fires the signal.
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(StopSignal {
            token: token.clone(),
        }));
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait up to `grace` for it to finish
    pub async fn stop(mut self, grace: Duration) {
        self.token.cancel();

        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(task = self.name, error = %e, "background task ended abnormally"),
            Err(_) => {
                tracing::warn!(task = self.name, ?grace, "background task ignored stop, aborting");
                self.handle.abort();
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum SlotState {
    Idle,
    Running(BackgroundTask),
    Stopped,
}

/// Holds a protocol's listener task and enforces start-once semantics
pub(crate) struct ListenerSlot {
    state: Mutex<SlotState>,
}

impl ListenerSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }

    /// Spawn the listener body, unless one was ever started on this slot
    pub(crate) async fn start<F, Fut>(&self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().await;
        if !matches!(*state, SlotState::Idle) {
            return Err(Error::AlreadyListening);
        }
        *state = SlotState::Running(BackgroundTask::spawn(name, body));
        Ok(())
    }

    /// Stop the listener if it is running; returns whether anything was stopped
    pub(crate) async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(*state, SlotState::Running(_)) {
            return false;
        }
        match std::mem::replace(&mut *state, SlotState::Stopped) {
            SlotState::Running(task) => {
                task.stop(LISTENER_STOP_GRACE).await;
                true
            }
            SlotState::Idle | SlotState::Stopped => false,
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        matches!(&*self.state.lock().await, SlotState::Running(task) if !task.is_finished())
    }
}
