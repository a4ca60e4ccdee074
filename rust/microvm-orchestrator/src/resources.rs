//! Host capacity ledger used for admission control.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::Resources;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;

#[derive(Debug)]
struct Ledger {
    available: Resources,
    reservations: HashMap<Uuid, Resources>,
}

/// Tracks what each live VM holds against the host's fixed capacity.
///
/// Reserve and release are atomic with respect to each other, so
/// `available == total - sum(reservations)` holds at every observation.
#[derive(Debug)]
pub struct HostResources {
    total: Resources,
    ledger: Mutex<Ledger>,
}

impl HostResources {
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            ledger: Mutex::new(Ledger {
                available: total,
                reservations: HashMap::new(),
            }),
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn available(&self) -> Resources {
        self.ledger.lock().available
    }

    pub fn reserved_for(&self, vm_id: &Uuid) -> Option<Resources> {
        self.ledger.lock().reservations.get(vm_id).copied()
    }

    pub fn reservation_count(&self) -> usize {
        self.ledger.lock().reservations.len()
    }

    /// Reserve `request` for `vm_id`. A VM already holding a reservation keeps it.
    pub fn try_reserve(&self, vm_id: Uuid, request: Resources) -> OrchestratorResult<()> {
        let mut ledger = self.ledger.lock();
        if ledger.reservations.contains_key(&vm_id) {
            return Ok(());
        }
        let Some(remaining) = ledger.available.checked_sub(&request) else {
            metrics::record_admission("rejected");
            return Err(OrchestratorError::InsufficientResources {
                requested: request.to_string(),
                available: ledger.available.to_string(),
            });
        };
        ledger.available = remaining;
        ledger.reservations.insert(vm_id, request);
        metrics::record_admission("admitted");
        debug!(vm_id = %vm_id, %request, available = %remaining, "Resources reserved");
        Ok(())
    }

    /// Swap the reservation of `vm_id` for `request`, keeping the old one on failure.
    pub fn resize(&self, vm_id: Uuid, request: Resources) -> OrchestratorResult<()> {
        let mut ledger = self.ledger.lock();
        let held = ledger.reservations.get(&vm_id).copied().unwrap_or_default();
        let Some(remaining) = ledger.available.saturating_add(&held).checked_sub(&request) else {
            metrics::record_admission("rejected");
            return Err(OrchestratorError::InsufficientResources {
                requested: request.to_string(),
                available: ledger.available.saturating_add(&held).to_string(),
            });
        };
        ledger.available = remaining;
        ledger.reservations.insert(vm_id, request);
        metrics::record_admission("admitted");
        Ok(())
    }

    /// Return whatever `vm_id` holds. Releasing twice is a no-op.
    pub fn release(&self, vm_id: &Uuid) -> Option<Resources> {
        let mut ledger = self.ledger.lock();
        let held = ledger.reservations.remove(vm_id)?;
        ledger.available = ledger.available.saturating_add(&held);
        debug!(vm_id = %vm_id, released = %held, available = %ledger.available, "Resources released");
        Some(held)
    }
}
