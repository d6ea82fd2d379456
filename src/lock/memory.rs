use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Lease, LockBackend};
use crate::error::Result;

/// Process-local leases. Enough when a single walletd instance talks to the nodes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    leases: DashMap<String, Lease>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, name: &str) -> Option<Lease> {
        self.leases.get(name).map(|l| l.value().clone())
    }
}

impl LockBackend for MemoryBackend {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        let lease = Lease::new(name, ttl, now);

        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired(now) {
                    held.insert(lease.clone());
                    Ok(Some(lease))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
                Ok(Some(lease))
            }
        }
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        self.leases
            .remove_if(&lease.name, |_, held| held.owner == lease.owner);
        Ok(())
    }
}
