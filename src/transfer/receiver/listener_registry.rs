use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::datagram::SubscriptionId;
use crate::listener::{DatagramListener, ListenerId};

/// Datagram listeners per subscription, in registration order
#[derive(Default)]
pub struct ListenerRegistry {
    by_subscription: FxHashMap<SubscriptionId, Vec<(ListenerId, Arc<dyn DatagramListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        Default::default()
    }

    /// returns `true` if this is the subscription's first listener
    pub fn register(&mut self, subscription_id: SubscriptionId, id: ListenerId, listener: Arc<dyn DatagramListener>) -> bool {
        let listeners = self.by_subscription.entry(subscription_id).or_default();
        listeners.push((id, listener));
        listeners.len() == 1
    }

    /// Returns `Some(true)` if the subscription's last listener was removed, and `None` if the
    ///  listener was not registered.
    pub fn unregister(&mut self, subscription_id: SubscriptionId, id: ListenerId) -> Option<bool> {
        let listeners = self.by_subscription.get_mut(&subscription_id)?;
        let idx = listeners.iter().position(|(l, _)| *l == id)?;
        listeners.remove(idx);

        if listeners.is_empty() {
            self.by_subscription.remove(&subscription_id);
            Some(true)
        }
        else {
            Some(false)
        }
    }

    pub fn listeners_for(&self, subscription_id: SubscriptionId) -> Vec<(ListenerId, Arc<dyn DatagramListener>)> {
        self.by_subscription.get(&subscription_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, subscription_id: SubscriptionId) -> bool {
        self.by_subscription.contains_key(&subscription_id)
    }

    pub fn num_listeners(&self, subscription_id: SubscriptionId) -> usize {
        self.by_subscription.get(&subscription_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
