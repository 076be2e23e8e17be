use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::datagram::datagram_id::DatagramId;
use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::result_code::SatelliteResult;

#[derive(Debug)]
pub struct PendingSendEntry {
    pub id: DatagramId,
    pub subscription_id: SubscriptionId,
    pub datagram_type: DatagramType,
    pub datagram: Datagram,
    pub need_full_screen_ui: bool,
    pub enqueued_at: Instant,
    pub reply: oneshot::Sender<SatelliteResult>,
}

impl PendingSendEntry {
    /// resolves the caller's request - a caller that stopped waiting is not an error
    pub fn complete(self, result: SatelliteResult) {
        let _ = self.reply.send(result);
    }
}

/// Outgoing datagrams waiting for (or in) transmission. The emergency queue is drained
///  completely before the normal queue is considered; within a queue, order is FIFO.
///
/// An entry stays at its position while it is being transmitted, and it is removed when the
///  transport completes it.
#[derive(Debug, Default)]
pub struct SendQueues {
    emergency: VecDeque<PendingSendEntry>,
    normal: VecDeque<PendingSendEntry>,
}

impl SendQueues {
    pub fn new() -> SendQueues {
        Default::default()
    }

    pub fn push(&mut self, entry: PendingSendEntry) {
        self.queue_mut(entry.datagram_type).push_back(entry);
    }

    pub fn next_eligible(&self) -> Option<&PendingSendEntry> {
        self.emergency.front()
            .or_else(|| self.normal.front())
    }

    pub fn get(&self, id: DatagramId) -> Option<&PendingSendEntry> {
        self.emergency.iter()
            .chain(self.normal.iter())
            .find(|e| e.id == id)
    }

    pub fn contains(&self, id: DatagramId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: DatagramId) -> Option<PendingSendEntry> {
        for queue in [&mut self.emergency, &mut self.normal] {
            if let Some(idx) = queue.iter().position(|e| e.id == id) {
                return queue.remove(idx);
            }
        }
        None
    }

    /// removes all entries, emergency entries first
    pub fn drain_all(&mut self) -> Vec<PendingSendEntry> {
        self.emergency.drain(..)
            .chain(self.normal.drain(..))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.emergency.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn queue_mut(&mut self, datagram_type: DatagramType) -> &mut VecDeque<PendingSendEntry> {
        match datagram_type {
            DatagramType::Emergency => &mut self.emergency,
            DatagramType::Normal => &mut self.normal,
        }
    }
}
