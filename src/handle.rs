//! Move-only kernel handle wrapper.
//!
//! Handles are opaque kernel object references relayed between the client and
//! the real provider. The proxy never creates or duplicates them; it only
//! transfers ownership. `Handle` has no `Clone`, and [`Handle::into_raw`] is
//! the single release operation, so a handle cannot be used after transfer.

use std::fmt;

/// An owned, transferable kernel handle.
pub struct Handle(u64);

impl Handle {
    /// Take ownership of a raw handle received from the client or provider.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Release the handle to its new owner, invalidating this reference.
    pub fn into_raw(self) -> u64 {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }

    /// Raw value, for diagnostics only. Ownership stays put.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x{:x})", self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Every handle the proxy touches must be transferred onward. A drop
        // here means a handle leaked instead of reaching its owner.
        tracing::warn!(handle = self.0, "kernel handle dropped without transfer");
    }
}
