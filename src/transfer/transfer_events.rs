use tokio::sync::broadcast;
use tracing::trace;

use crate::datagram::{DatagramType, SubscriptionId};
use crate::transfer::transfer_state::TransferStatus;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferEvent {
    SendStateChanged(TransferStateChangedData),
    ReceiveStateChanged(TransferStateChangedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferStateChangedData {
    pub subscription_id: SubscriptionId,
    /// `None` for the receive side, which does not know what it is going to receive
    pub datagram_type: Option<DatagramType>,
    pub status: TransferStatus,
}

pub struct TransferEventNotifier {
    sender: broadcast::Sender<TransferEvent>,
}
impl TransferEventNotifier {
    pub fn new() -> TransferEventNotifier {
        let (sender, _) = broadcast::channel(128);

        TransferEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: TransferEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for TransferEventNotifier {
    fn default() -> Self {
        TransferEventNotifier::new()
    }
}
