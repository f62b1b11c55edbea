use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Single-slot handoff for the host's answer to a permission request.
#[derive(Debug, Default)]
pub struct PermissionSlot {
    decision: Mutex<Option<bool>>,
    delivered: Condvar,
}

impl PermissionSlot {
    pub fn new() -> PermissionSlot {
        PermissionSlot::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<bool>> {
        self.decision.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops a decision left over from an earlier request.
    pub fn clear(&self) {
        self.lock().take();
    }

    /// Stores `granted`, replacing any decision not yet taken.
    pub fn deliver(&self, granted: bool) {
        trace!(granted, "PermissionSlot::deliver");
        *self.lock() = Some(granted);
        self.delivered.notify_all();
    }

    /// Blocks until a decision is available and consumes it.
    pub fn take(&self) -> bool {
        let mut decision = self.lock();
        loop {
            if let Some(granted) = decision.take() {
                return granted;
            }
            decision = self
                .delivered
                .wait(decision)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Handed to the host with each permission request, consumed by answering it.
#[derive(Debug)]
pub struct PermissionReply(Arc<PermissionSlot>);

impl PermissionReply {
    pub(crate) fn new(slot: Arc<PermissionSlot>) -> PermissionReply {
        PermissionReply(slot)
    }

    pub fn deliver(self, granted: bool) {
        self.0.deliver(granted)
    }
}
