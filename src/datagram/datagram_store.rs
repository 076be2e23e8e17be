use std::sync::Mutex;

#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;

use crate::datagram::datagram_id::DatagramId;
use crate::datagram::{Datagram, SubscriptionId};
use crate::util::lock;

/// Persists the id of the last received datagram, so id allocation survives a restart
#[cfg_attr(test, automock)]
pub trait DurableCounterStore: Send + Sync + 'static {
    fn load_last_id(&self) -> anyhow::Result<Option<DatagramId>>;
    fn persist_last_id(&self, id: DatagramId) -> anyhow::Result<()>;
}

/// Durable copy of every received datagram that is not yet acknowledged by all listeners
#[cfg_attr(test, automock)]
pub trait DatagramStore: Send + Sync + 'static {
    fn insert(&self, subscription_id: SubscriptionId, id: DatagramId, datagram: &Datagram) -> anyhow::Result<()>;
    /// returns `false` if there was no datagram with this id
    fn delete(&self, id: DatagramId) -> anyhow::Result<bool>;
    fn stored_ids(&self) -> anyhow::Result<Vec<DatagramId>>;
}


#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    last_id: Mutex<Option<DatagramId>>,
}

impl InMemoryCounterStore {
    pub fn new() -> InMemoryCounterStore {
        Default::default()
    }

    pub fn starting_at(last_id: DatagramId) -> InMemoryCounterStore {
        InMemoryCounterStore {
            last_id: Mutex::new(Some(last_id)),
        }
    }

    pub fn last_id(&self) -> Option<DatagramId> {
        *lock(&self.last_id)
    }
}

impl DurableCounterStore for InMemoryCounterStore {
    fn load_last_id(&self) -> anyhow::Result<Option<DatagramId>> {
        Ok(self.last_id())
    }

    fn persist_last_id(&self, id: DatagramId) -> anyhow::Result<()> {
        *lock(&self.last_id) = Some(id);
        Ok(())
    }
}


#[derive(Debug, Default)]
pub struct InMemoryDatagramStore {
    entries: Mutex<FxHashMap<DatagramId, (SubscriptionId, Datagram)>>,
}

impl InMemoryDatagramStore {
    pub fn new() -> InMemoryDatagramStore {
        Default::default()
    }

    pub fn contains(&self, id: DatagramId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    pub fn get(&self, id: DatagramId) -> Option<(SubscriptionId, Datagram)> {
        lock(&self.entries).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatagramStore for InMemoryDatagramStore {
    fn insert(&self, subscription_id: SubscriptionId, id: DatagramId, datagram: &Datagram) -> anyhow::Result<()> {
        lock(&self.entries).insert(id, (subscription_id, datagram.clone()));
        Ok(())
    }

    fn delete(&self, id: DatagramId) -> anyhow::Result<bool> {
        Ok(lock(&self.entries).remove(&id).is_some())
    }

    fn stored_ids(&self) -> anyhow::Result<Vec<DatagramId>> {
        let mut result = lock(&self.entries).keys().cloned().collect::<Vec<_>>();
        result.sort();
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_in_memory_datagram_store() {
        let store = InMemoryDatagramStore::new();
        let id = DatagramId::from_raw(3);

        store.insert(1, id, &Datagram::new("abc")).unwrap();
        store.insert(1, DatagramId::from_raw(1), &Datagram::new("x")).unwrap();

        assert!(store.contains(id));
        assert_eq!(store.get(id), Some((1, Datagram::new("abc"))));
        assert_eq!(store.stored_ids().unwrap(), vec![DatagramId::from_raw(1), id]);

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(!store.contains(id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_in_memory_counter_store() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.load_last_id().unwrap(), None);
        store.persist_last_id(DatagramId::from_raw(9)).unwrap();
        assert_eq!(store.load_last_id().unwrap(), Some(DatagramId::from_raw(9)));
    }
}
