use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::datagram::datagram_id::DatagramId;
use crate::datagram::{Datagram, SubscriptionId};
use crate::listener::{DatagramListener, ListenerId};

#[derive(Debug, Eq, PartialEq)]
pub enum AckOutcome {
    /// the datagram is not (or no longer) waiting for acknowledgements
    Unknown,
    /// the listener acknowledged before, or was never delivered to
    Duplicate,
    /// this many listeners still have to acknowledge
    Pending(usize),
    /// every listener acknowledged, the entry is gone
    Complete,
}

/// A received datagram that was delivered to listeners which did not all acknowledge yet.
///
/// The listeners are held here rather than looked up in the registry, so redelivery keeps
///  working for a listener that unregistered after the datagram arrived.
pub struct PendingDelivery {
    pub subscription_id: SubscriptionId,
    pub datagram: Datagram,
    pub pending_count: i32,
    pending_ack_count: usize,
    awaiting: FxHashMap<ListenerId, Arc<dyn DatagramListener>>,
}

impl PendingDelivery {
    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack_count
    }
}

#[derive(Default)]
pub struct PendingAcks {
    entries: FxHashMap<DatagramId, PendingDelivery>,
}

impl PendingAcks {
    pub fn new() -> PendingAcks {
        Default::default()
    }

    pub fn insert(&mut self, id: DatagramId, subscription_id: SubscriptionId, datagram: Datagram, pending_count: i32, listeners: &[(ListenerId, Arc<dyn DatagramListener>)]) {
        self.entries.insert(id, PendingDelivery {
            subscription_id,
            datagram,
            pending_count,
            pending_ack_count: listeners.len(),
            awaiting: listeners.iter().cloned().collect(),
        });
    }

    pub fn get(&self, id: DatagramId) -> Option<&PendingDelivery> {
        self.entries.get(&id)
    }

    /// the listener, if it still has to acknowledge the datagram
    pub fn awaiting_listener(&self, id: DatagramId, listener: ListenerId) -> Option<Arc<dyn DatagramListener>> {
        self.entries.get(&id)?
            .awaiting.get(&listener)
            .cloned()
    }

    /// Each listener's acknowledgement counts exactly once, no matter how often the datagram
    ///  was (re-)delivered to it.
    pub fn acknowledge(&mut self, id: DatagramId, listener: ListenerId) -> AckOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return AckOutcome::Unknown;
        };
        if entry.awaiting.remove(&listener).is_none() {
            return AckOutcome::Duplicate;
        }

        entry.pending_ack_count = entry.pending_ack_count.saturating_sub(1);
        let pending_ack_count = entry.pending_ack_count;
        if pending_ack_count == 0 {
            self.entries.remove(&id);
            return AckOutcome::Complete;
        }
        if entry.awaiting.is_empty() {
            // the remaining listeners are gone
            self.entries.remove(&id);
        }
        AckOutcome::Pending(pending_ack_count)
    }

    /// Stops waiting for a listener that is gone. Its acknowledgement never arrives, so the
    ///  pending ack count is left as it is and the durable copy is kept; entries nobody is
    ///  waiting for any more are dropped from memory. Returns the ids the listener was still
    ///  awaited for.
    pub fn forget_listener(&mut self, listener: ListenerId) -> Vec<DatagramId> {
        let mut result = Vec::new();
        self.entries.retain(|id, entry| {
            if entry.awaiting.remove(&listener).is_some() {
                result.push(*id);
            }
            !entry.awaiting.is_empty()
        });
        result
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::listener::ChannelDatagramListener;
    use super::*;

    fn listeners(n: usize) -> Vec<(ListenerId, Arc<dyn DatagramListener>)> {
        (0..n)
            .map(|_| {
                let (listener, _) = ChannelDatagramListener::new();
                (ListenerId::new(), Arc::new(listener) as Arc<dyn DatagramListener>)
            })
            .collect()
    }

    #[test]
    fn test_complete_after_all_acks() {
        let id = DatagramId::from_raw(5);
        let l = listeners(2);
        let mut acks = PendingAcks::new();
        acks.insert(id, 1, Datagram::new("x"), 0, &l);
        assert_eq!(acks.get(id).unwrap().pending_ack_count(), 2);

        assert_eq!(acks.acknowledge(id, l[0].0), AckOutcome::Pending(1));
        assert!(acks.awaiting_listener(id, l[0].0).is_none());
        assert!(acks.awaiting_listener(id, l[1].0).is_some());

        assert_eq!(acks.acknowledge(id, l[1].0), AckOutcome::Complete);
        assert!(acks.is_empty());
        assert_eq!(acks.acknowledge(id, l[1].0), AckOutcome::Unknown);
    }

    #[test]
    fn test_duplicate_ack_counts_once() {
        let id = DatagramId::from_raw(5);
        let l = listeners(2);
        let mut acks = PendingAcks::new();
        acks.insert(id, 1, Datagram::new("x"), 0, &l);

        assert_eq!(acks.acknowledge(id, l[0].0), AckOutcome::Pending(1));
        assert_eq!(acks.acknowledge(id, l[0].0), AckOutcome::Duplicate);
        assert_eq!(acks.get(id).unwrap().pending_ack_count(), 1);
    }

    #[test]
    fn test_forget_listener() {
        let first = DatagramId::from_raw(1);
        let second = DatagramId::from_raw(2);
        let l = listeners(2);
        let mut acks = PendingAcks::new();
        acks.insert(first, 1, Datagram::new("a"), 0, &l);
        acks.insert(second, 1, Datagram::new("b"), 0, &l[1..]);
        assert_eq!(acks.len(), 2);

        let mut forgotten = acks.forget_listener(l[1].0);
        forgotten.sort();
        assert_eq!(forgotten, vec![first, second]);

        // nobody left to wait for
        assert!(acks.get(second).is_none());
        assert_eq!(acks.len(), 1);

        // the count is untouched, so the remaining ack does not complete the datagram
        assert_eq!(acks.get(first).unwrap().pending_ack_count(), 2);
        assert_eq!(acks.acknowledge(first, l[0].0), AckOutcome::Pending(1));
        assert!(acks.is_empty());
    }
}
