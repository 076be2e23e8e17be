use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::result_code::SatelliteError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum DatagramTransferState {
    Unknown = -1,
    Idle = 0,
    Sending = 1,
    SendSuccess = 2,
    SendFailed = 3,
    Receiving = 4,
    ReceiveSuccess = 5,
    ReceiveNone = 6,
    ReceiveFailed = 7,
}

impl DatagramTransferState {
    pub fn is_failure(&self) -> bool {
        matches!(self, DatagramTransferState::SendFailed | DatagramTransferState::ReceiveFailed)
    }
}

/// One side's (send or receive) transfer state as reported to status listeners
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransferStatus {
    pub state: DatagramTransferState,
    /// send side: datagrams still queued, receive side: datagrams still waiting at the modem
    pub pending_count: i32,
    pub error: Option<SatelliteError>,
}

impl TransferStatus {
    pub fn idle() -> TransferStatus {
        TransferStatus::new(DatagramTransferState::Idle, 0)
    }

    pub fn new(state: DatagramTransferState, pending_count: i32) -> TransferStatus {
        TransferStatus {
            state,
            pending_count,
            error: None,
        }
    }

    pub fn failed(state: DatagramTransferState, pending_count: i32, error: SatelliteError) -> TransferStatus {
        TransferStatus {
            state,
            pending_count,
            error: Some(error),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == DatagramTransferState::Idle
    }
}
