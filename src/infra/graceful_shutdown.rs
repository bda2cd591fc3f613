//! Graceful shutdown handling
//!
//! Workers check the shutdown signal before popping the next trace and never
//! abandon a trace mid-commit. The coordinator flips the signal and then
//! waits for in-flight traces to drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown signal that can be cloned and shared
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Check if shutdown has been initiated
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait for the shutdown signal
    ///
    /// Returns immediately if shutdown already started, including when the
    /// coordinator was dropped.
    pub async fn wait(&self) {
        let mut rx = self.watch_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Counts traces currently being analyzed
#[derive(Default)]
pub struct InFlightTracker {
    active: AtomicU64,
    total: AtomicU64,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a trace as in flight until the guard drops
    pub fn start(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { tracker: self }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Wait for all in-flight traces to finish
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();

        while self.active_count() > 0 {
            if start.elapsed() > timeout {
                warn!(
                    active = self.active_count(),
                    "Timeout waiting for in-flight traces to drain"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("All in-flight traces drained");
        true
    }
}

/// Guard that decrements the in-flight count when dropped
pub struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
}

impl<'a> Drop for InFlightGuard<'a> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shutdown coordinator shared by the service and its workers
pub struct ShutdownCoordinator {
    shutdown: Arc<AtomicBool>,
    watch_tx: watch::Sender<bool>,
    in_flight: Arc<InFlightTracker>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);

        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            watch_tx,
            in_flight: Arc::new(InFlightTracker::new()),
        }
    }

    /// Get a shutdown signal that can be cloned
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown: self.shutdown.clone(),
            watch_rx: self.watch_tx.subscribe(),
        }
    }

    pub fn in_flight(&self) -> Arc<InFlightTracker> {
        self.in_flight.clone()
    }

    /// Initiate shutdown
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown...");
        self.watch_tx.send_replace(true);
    }

    /// Initiate shutdown and wait for in-flight traces
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) -> bool {
        self.shutdown();

        info!(
            active = self.in_flight.active_count(),
            "Waiting for in-flight traces to complete..."
        );

        let drained = self.in_flight.wait_for_drain(drain_timeout).await;
        info!(drained, "Graceful shutdown complete");
        drained
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Future that completes on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        assert!(!signal.is_shutdown());
        coordinator.shutdown();
        assert!(signal.is_shutdown());

        // already signalled; must not hang
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_wakes_on_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        let waiter = tokio::spawn(async move { signal.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_tracker() {
        let tracker = InFlightTracker::new();

        {
            let _guard1 = tracker.start();
            let _guard2 = tracker.start();
            assert_eq!(tracker.active_count(), 2);
        }

        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_count(), 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let tracker = Arc::new(InFlightTracker::new());
        let tracker2 = tracker.clone();

        let held = tracker.clone();
        let worker = tokio::spawn(async move {
            let _guard = held.start();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let drained = tracker2.wait_for_drain(Duration::from_secs(5)).await;
        assert!(drained);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let tracker = InFlightTracker::new();
        let _guard = tracker.start();
        assert!(!tracker.wait_for_drain(Duration::from_millis(20)).await);
    }
}
