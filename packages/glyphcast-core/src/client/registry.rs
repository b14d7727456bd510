//! The global client registry: hash index over slot-array backing, guarded
//! by one reader-writer lock.
//!
//! # Concurrency design
//!
//! - Writers (add/remove) take the write lock; readers (enumeration for a
//!   render tick) take the read lock briefly and snapshot the `Arc`s they
//!   need. Nothing holds the registry lock across codec calls or I/O.
//! - Allowed lock order: registry read lock → per-record state mutex. The
//!   reverse is forbidden.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::HubError;

use super::{ClientId, ClientRecord};

struct RegistryInner {
    /// ClientId → slot index.
    index: HashMap<ClientId, usize>,
    /// Slot array; freed slots are reused, ids never are.
    slots: Vec<Option<Arc<ClientRecord>>>,
}

pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU32,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                index: HashMap::new(),
                slots: Vec::new(),
            }),
            next_id: AtomicU32::new(1),
            max_clients,
        }
    }

    /// Allocates the next client id. Ids are process-unique and never reused.
    pub fn allocate_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts a record, enforcing the configured client limit.
    pub fn insert(&self, record: Arc<ClientRecord>) -> Result<(), HubError> {
        let mut inner = self.inner.write();
        if inner.index.len() >= self.max_clients {
            return Err(HubError::Resource(format!(
                "server full ({} clients)",
                self.max_clients
            )));
        }
        if inner.index.contains_key(&record.id) {
            return Err(HubError::InvalidArgument(format!(
                "client {} already registered",
                record.id
            )));
        }
        let slot = inner.slots.iter().position(Option::is_none);
        let slot = match slot {
            Some(slot) => {
                inner.slots[slot] = Some(record.clone());
                slot
            }
            None => {
                inner.slots.push(Some(record.clone()));
                inner.slots.len() - 1
            }
        };
        inner.index.insert(record.id, slot);
        Ok(())
    }

    /// Removes and returns a record. The caller joins the record's workers
    /// before dropping its handle.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        let mut inner = self.inner.write();
        let slot = inner.index.remove(&id)?;
        inner.slots[slot].take()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        let inner = self.inner.read();
        let slot = *inner.index.get(&id)?;
        inner.slots[slot].clone()
    }

    /// Snapshots every registered record (active or not; callers filter).
    pub fn snapshot(&self) -> Vec<Arc<ClientRecord>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(Clone::clone)
            .collect()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.inner.read().index.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Attachment;
    use crate::config::HostConfig;
    use crate::transport::TransportSlot;

    fn registry_with(max: usize) -> ClientRegistry {
        ClientRegistry::new(max)
    }

    fn record_for(registry: &ClientRegistry) -> Arc<ClientRecord> {
        Arc::new(ClientRecord::new(
            registry.allocate_id(),
            None,
            Attachment::Memory,
            TransportSlot::detached(),
            &HostConfig::default(),
        ))
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let registry = registry_with(8);
        let first = registry.allocate_id();
        let second = registry.allocate_id();
        assert!(second > first);
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let registry = registry_with(8);
        let record = record_for(&registry);
        let id = record.id;

        registry.insert(record).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn slots_are_reused_but_ids_are_not() {
        let registry = registry_with(8);
        let first = record_for(&registry);
        let first_id = first.id;
        registry.insert(first).unwrap();
        registry.remove(first_id).unwrap();

        let second = record_for(&registry);
        assert_ne!(second.id, first_id);
        registry.insert(second).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let registry = registry_with(2);
        registry.insert(record_for(&registry)).unwrap();
        registry.insert(record_for(&registry)).unwrap();
        let overflow = record_for(&registry);
        assert!(matches!(
            registry.insert(overflow),
            Err(HubError::Resource(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = registry_with(4);
        let record = record_for(&registry);
        registry.insert(record.clone()).unwrap();
        assert!(matches!(
            registry.insert(record),
            Err(HubError::InvalidArgument(_))
        ));
    }

    #[test]
    fn snapshot_returns_all_records() {
        let registry = registry_with(8);
        for _ in 0..3 {
            registry.insert(record_for(&registry)).unwrap();
        }
        assert_eq!(registry.snapshot().len(), 3);
        assert_eq!(registry.ids().len(), 3);
    }
}
