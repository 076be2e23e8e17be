use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::datagram::datagram_store::DurableCounterStore;
use crate::util::lock;

/// Datagram ids wrap around at this value
pub const MAX_DATAGRAM_ID: u32 = 1 << 16;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DatagramId(u32);

impl Display for DatagramId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DatagramId {
    pub const ZERO: DatagramId = DatagramId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value % MAX_DATAGRAM_ID)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> DatagramId {
        DatagramId((self.0 + 1) % MAX_DATAGRAM_ID)
    }
}

/// Ids for outgoing datagrams. They are only used for correlating transport completions with
///  queue entries, so they live in memory only.
#[derive(Debug)]
pub struct SendIdAllocator {
    next: AtomicU32,
}

impl SendIdAllocator {
    pub fn new() -> SendIdAllocator {
        SendIdAllocator::starting_at(DatagramId::ZERO)
    }

    pub fn starting_at(first: DatagramId) -> SendIdAllocator {
        SendIdAllocator {
            next: AtomicU32::new(first.to_raw()),
        }
    }

    pub fn allocate(&self) -> DatagramId {
        let raw = self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| Some(DatagramId::from_raw(raw).next().to_raw()))
            .unwrap_or_else(|raw| raw);
        DatagramId::from_raw(raw)
    }
}

impl Default for SendIdAllocator {
    fn default() -> Self {
        SendIdAllocator::new()
    }
}

/// Ids for received datagrams. The last allocated id is persisted, so ids keep increasing
///  across restarts and never collide with datagrams still sitting in the durable store.
///
/// If the store fails, allocation continues from an in-memory counter rather than failing
///  the delivery.
pub struct DurableIdAllocator {
    store: Arc<dyn DurableCounterStore>,
    last_allocated: Mutex<Option<DatagramId>>,
}

impl DurableIdAllocator {
    pub fn new(store: Arc<dyn DurableCounterStore>) -> DurableIdAllocator {
        DurableIdAllocator {
            store,
            last_allocated: Mutex::new(None),
        }
    }

    pub fn allocate(&self) -> DatagramId {
        let mut last_allocated = lock(&self.last_allocated);

        let previous = match self.store.load_last_id() {
            Ok(persisted) => persisted.unwrap_or(DatagramId::ZERO),
            Err(e) => {
                warn!("could not load last received datagram id, continuing from memory: {}", e);
                last_allocated.unwrap_or(DatagramId::ZERO)
            }
        };

        let id = previous.next();
        if let Err(e) = self.store.persist_last_id(id) {
            warn!("could not persist received datagram id {}: {}", id, e);
        }
        debug!("allocated received datagram id {}", id);

        *last_allocated = Some(id);
        id
    }
}
