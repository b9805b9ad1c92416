//! Graceful shutdown coordination.
//!
//! Tracks in-flight dispatches so the process can stop accepting work and
//! drain what remains before exit. Session teardown cascades still run after
//! a drain times out; only new requests are refused.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Coordinates draining of in-flight dispatches at shutdown.
pub struct ShutdownCoordinator {
    state: AtomicU8,
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_RUNNING),
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => ShutdownState::Running,
            STATE_DRAINING => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Track one in-flight dispatch. Returns `None` once draining started.
    pub fn track(&self) -> Option<ShutdownGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ShutdownGuard {
            counter: Arc::clone(&self.in_flight),
            notify: Arc::clone(&self.notify),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting new dispatches and wait for in-flight ones to finish.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.state.store(STATE_DRAINING, Ordering::SeqCst);
        let result = self.wait_for_drain(timeout).await;
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining) => {
                    let count = self.in_flight_count();
                    if count == 0 {
                        return ShutdownResult::Complete;
                    }
                    return ShutdownResult::Timeout { remaining: count };
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight dispatch.
pub struct ShutdownGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_completes_when_idle() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), ShutdownState::Running);

        let result = coordinator.initiate(Duration::from_millis(50)).await;
        assert_eq!(result, ShutdownResult::Complete);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn track_refused_while_draining() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track().unwrap();
        assert_eq!(coordinator.in_flight_count(), 1);

        drop(guard);
        coordinator.initiate(Duration::from_millis(50)).await;
        assert!(coordinator.track().is_none());
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_guard() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.track().unwrap();

        let result = coordinator.initiate(Duration::from_millis(20)).await;
        assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });
    }

    #[tokio::test]
    async fn guard_drop_unblocks_drain() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let guard = coordinator.track().unwrap();

        let drainer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.initiate(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        let result = drainer.await.unwrap();
        assert_eq!(result, ShutdownResult::Complete);
    }
}
