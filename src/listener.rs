use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::datagram::datagram_id::DatagramId;
use crate::datagram::Datagram;
use crate::modem::SatelliteModemState;

/// Handle for a registered listener, used for unregistering it
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new() -> ListenerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Receives incoming datagrams. Every delivery carries a [DatagramAck] which the listener
///  must acknowledge once it is done with the datagram; unacknowledged datagrams are
///  redelivered periodically, so a listener must tolerate duplicates.
///
/// Returning an error means the listener is gone for good: it is unregistered and never
///  called again.
pub trait DatagramListener: Send + Sync + 'static {
    fn on_satellite_datagram_received(&self, id: DatagramId, datagram: Datagram, pending_count: i32, ack: DatagramAck) -> anyhow::Result<()>;
}

/// Returning an error means the listener is gone for good and is pruned.
pub trait ModemStateListener: Send + Sync + 'static {
    fn on_satellite_modem_state_changed(&self, state: SatelliteModemState) -> anyhow::Result<()>;
}

pub struct DatagramAck {
    on_ack: Box<dyn FnOnce() + Send>,
}

impl DatagramAck {
    pub fn new(on_ack: impl FnOnce() + Send + 'static) -> DatagramAck {
        DatagramAck {
            on_ack: Box::new(on_ack),
        }
    }

    pub fn acknowledge(self) {
        (self.on_ack)()
    }
}

impl Debug for DatagramAck {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatagramAck")
    }
}


#[derive(Debug)]
pub struct ReceivedDatagram {
    pub id: DatagramId,
    pub datagram: Datagram,
    pub pending_count: i32,
    pub ack: DatagramAck,
}

/// Forwards deliveries into a channel. Dropping the receiving end makes the listener
///  unreachable.
pub struct ChannelDatagramListener {
    sender: mpsc::UnboundedSender<ReceivedDatagram>,
}

impl ChannelDatagramListener {
    pub fn new() -> (ChannelDatagramListener, mpsc::UnboundedReceiver<ReceivedDatagram>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelDatagramListener { sender }, receiver)
    }
}

impl DatagramListener for ChannelDatagramListener {
    fn on_satellite_datagram_received(&self, id: DatagramId, datagram: Datagram, pending_count: i32, ack: DatagramAck) -> anyhow::Result<()> {
        self.sender.send(ReceivedDatagram { id, datagram, pending_count, ack })
            .map_err(|_| anyhow::anyhow!("datagram listener channel is closed"))
    }
}

pub struct ChannelModemStateListener {
    sender: mpsc::UnboundedSender<SatelliteModemState>,
}

impl ChannelModemStateListener {
    pub fn new() -> (ChannelModemStateListener, mpsc::UnboundedReceiver<SatelliteModemState>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelModemStateListener { sender }, receiver)
    }
}

impl ModemStateListener for ChannelModemStateListener {
    fn on_satellite_modem_state_changed(&self, state: SatelliteModemState) -> anyhow::Result<()> {
        self.sender.send(state)
            .map_err(|_| anyhow::anyhow!("modem state listener channel is closed"))
    }
}
