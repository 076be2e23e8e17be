use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod transport;

/// Operating mode of the satellite modem, as reported to modem state listeners and pushed by
///  the transport
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum SatelliteModemState {
    Unknown = -1,
    Idle = 0,
    Listening = 1,
    DatagramTransferring = 2,
    DatagramRetrying = 3,
    Off = 4,
    Unavailable = 5,
}

impl SatelliteModemState {
    /// modem states in which nothing that is queued or in flight can make progress
    pub fn is_off_or_unavailable(&self) -> bool {
        matches!(self, SatelliteModemState::Off | SatelliteModemState::Unavailable)
    }
}
