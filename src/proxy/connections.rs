//! Per-port session accounting.
//!
//! Each listening port carries a maximum concurrent session count. Slots are
//! atomic-counted and released by RAII guards, so a session that ends for any
//! reason frees its slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Session slot pool for one port.
pub struct PortSessionPool {
    active: AtomicUsize,
    max_sessions: usize,
}

impl PortSessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self { active: AtomicUsize::new(0), max_sessions }
    }

    /// Try to claim a slot. Returns an owned guard if the port is below its
    /// session limit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionSlot> {
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current >= self.max_sessions {
                return None;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SessionSlot { pool: Arc::clone(self) });
            }
            // CAS lost the race, retry.
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owned RAII guard for one session slot.
pub struct SessionSlot {
    pool: Arc<PortSessionPool>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.pool.release();
    }
}
