//! Per-service readiness tracking.
//!
//! The gate is the fan-in point for container-engine lifecycle events,
//! host-process launches, and health transitions. Each service walks
//! `pending → started → healthy`, with `die` dropping it into the terminal
//! `failed` state. The first failure wins: it is published on the exit
//! channel and surfaced by `wait_for_ready` no matter what the other
//! services do afterwards.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lifecycle state of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not yet observed by the runtime
    Pending,
    /// The container started (or the host process was spawned)
    Started,
    /// The readiness check passed
    Healthy,
    /// The service died or its health check gave up (terminal)
    Failed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Healthy => write!(f, "healthy"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Callback invoked on every status transition
pub type StatusCallback = Box<dyn Fn(&str, ServiceStatus) + Send + Sync>;

#[derive(Debug)]
struct Entry {
    status: ServiceStatus,
    has_ready_check: bool,
    host: bool,
}

impl Entry {
    // Host services count as ready the moment their child process is
    // launched; containers additionally need their declared health check.
    fn is_ready(&self) -> bool {
        match self.status {
            ServiceStatus::Failed | ServiceStatus::Pending => false,
            ServiceStatus::Healthy => true,
            ServiceStatus::Started => self.host || !self.has_ready_check,
        }
    }
}

/// Aggregated readiness state for every service in a session
pub struct ReadinessGate {
    inner: Mutex<HashMap<String, Entry>>,
    first_error: Mutex<Option<(String, String)>>,
    callbacks: Mutex<Vec<StatusCallback>>,
    changed_tx: watch::Sender<u64>,
    exit_tx: mpsc::UnboundedSender<Error>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create an empty gate
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(0);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(HashMap::new()),
            first_error: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            changed_tx,
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
        }
    }

    /// Register a service before launch
    pub fn register(&self, service: impl Into<String>, has_ready_check: bool, host: bool) {
        let service = service.into();
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            service,
            Entry {
                status: ServiceStatus::Pending,
                has_ready_check,
                host,
            },
        );
        self.bump();
    }

    /// Record a `start` event
    pub fn on_started(&self, service: &str) {
        self.transition(service, ServiceStatus::Started);
    }

    /// Record a healthy health-status event
    pub fn on_healthy(&self, service: &str) {
        self.transition(service, ServiceStatus::Healthy);
    }

    /// Record a `die` event. Terminal; publishes the first error on the
    /// exit channel.
    pub fn on_failed(&self, service: &str, message: impl Into<String>) {
        let message = message.into();
        let changed = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match inner.get_mut(service) {
                Some(entry) if entry.status != ServiceStatus::Failed => {
                    entry.status = ServiceStatus::Failed;
                    true
                }
                _ => false,
            }
        };
        if !changed {
            return;
        }
        warn!(service, %message, "service failed");
        {
            let mut first = self
                .first_error
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if first.is_none() {
                *first = Some((service.to_string(), message.clone()));
            }
        }
        let _ = self.exit_tx.send(Error::lifecycle(service, message));
        self.notify(service, ServiceStatus::Failed);
        self.bump();
    }

    /// Current status of a service
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(service)
            .map(|e| e.status)
    }

    /// Whether every registered service is ready
    pub fn are_ready(&self) -> bool {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !inner.is_empty() && inner.values().all(Entry::is_ready)
    }

    /// The first failure observed, if any
    pub fn first_error(&self) -> Option<Error> {
        self.first_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|(service, message)| Error::lifecycle(service, message))
    }

    /// Take the exit-error channel. Further failures after the first are
    /// delivered here too, in observation order.
    pub fn take_exit_receiver(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.exit_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Register a callback invoked on every status transition
    pub fn on_update(&self, callback: StatusCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(callback);
    }

    /// Block until every service is ready, the first failure, the
    /// deadline, or cancellation.
    pub async fn wait_for_ready(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut changed = self.changed_tx.subscribe();
        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        loop {
            if let Some(err) = self.first_error() {
                return Err(err);
            }
            if self.are_ready() {
                return Ok(());
            }
            tokio::select! {
                _ = changed.changed() => {}
                () = &mut timer => return Err(Error::timeout(deadline.as_secs())),
                () = cancel.cancelled() => return Err(Error::Interrupted),
            }
        }
    }

    fn transition(&self, service: &str, next: ServiceStatus) {
        let changed = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match inner.get_mut(service) {
                Some(entry) => {
                    // Monotonic: healthy never regresses to started, and
                    // failed is terminal.
                    let allowed = match (entry.status, next) {
                        (ServiceStatus::Pending, ServiceStatus::Started | ServiceStatus::Healthy)
                        | (ServiceStatus::Started, ServiceStatus::Healthy) => true,
                        _ => false,
                    };
                    if allowed {
                        entry.status = next;
                    }
                    allowed
                }
                None => {
                    debug!(service, "ignoring event for unregistered service");
                    false
                }
            }
        };
        if changed {
            debug!(service, status = %next, "service transition");
            self.notify(service, next);
            self.bump();
        }
    }

    fn notify(&self, service: &str, status: ServiceStatus) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(service, status);
        }
    }

    fn bump(&self) {
        self.changed_tx.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_plain_service_ready_on_start() {
        let gate = ReadinessGate::new();
        gate.register("el", false, false);
        assert!(!gate.are_ready());
        gate.on_started("el");
        assert!(gate.are_ready());
    }

    #[test]
    fn test_checked_service_needs_healthy() {
        let gate = ReadinessGate::new();
        gate.register("el", true, false);
        gate.on_started("el");
        assert!(!gate.are_ready());
        gate.on_healthy("el");
        assert!(gate.are_ready());
    }

    #[test]
    fn test_host_service_ready_on_launch() {
        let gate = ReadinessGate::new();
        gate.register("el", true, true);
        gate.on_started("el");
        assert!(gate.are_ready());
    }

    #[test]
    fn test_empty_gate_is_not_ready() {
        let gate = ReadinessGate::new();
        assert!(!gate.are_ready());
    }

    #[test]
    fn test_failure_is_terminal_and_first_wins() {
        let gate = ReadinessGate::new();
        gate.register("el", false, false);
        gate.register("cl", false, false);
        gate.on_failed("el", "exited with code 1");
        gate.on_failed("cl", "exited with code 2");
        gate.on_started("el");
        assert_eq!(gate.status("el"), Some(ServiceStatus::Failed));
        let err = gate.first_error().unwrap();
        assert!(err.to_string().contains("el"));
    }

    #[test]
    fn test_healthy_is_monotonic() {
        let gate = ReadinessGate::new();
        gate.register("el", true, false);
        gate.on_started("el");
        gate.on_healthy("el");
        gate.on_started("el");
        assert_eq!(gate.status("el"), Some(ServiceStatus::Healthy));
    }

    #[test]
    fn test_exit_channel_receives_failures() {
        let gate = ReadinessGate::new();
        let mut rx = gate.take_exit_receiver().unwrap();
        gate.register("el", false, false);
        gate.on_failed("el", "died");
        let err = rx.try_recv().unwrap();
        assert_eq!(err.category(), "lifecycle");
    }

    #[test]
    fn test_callbacks_fire_on_transitions() {
        let gate = ReadinessGate::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        gate.on_update(Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        gate.register("el", true, false);
        gate.on_started("el");
        gate.on_healthy("el");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_for_ready_success() {
        let gate = Arc::new(ReadinessGate::new());
        gate.register("el", false, false);
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_for_ready(Duration::from_secs(5), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.on_started("el");
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_timeout() {
        let gate = ReadinessGate::new();
        gate.register("el", false, false);
        let cancel = CancellationToken::new();
        let err = gate
            .wait_for_ready(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "timeout");
    }

    #[tokio::test]
    async fn test_wait_for_ready_first_failure() {
        let gate = ReadinessGate::new();
        gate.register("el", false, false);
        gate.on_failed("el", "exited with code 1");
        let cancel = CancellationToken::new();
        let err = gate
            .wait_for_ready(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "lifecycle");
    }

    #[tokio::test]
    async fn test_wait_for_ready_cancellation() {
        let gate = ReadinessGate::new();
        gate.register("el", false, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate
            .wait_for_ready(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "signal");
    }
}
