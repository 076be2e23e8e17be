use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Result code reported for a successful operation
pub const SUCCESS_CODE: i32 = 0;

/// Failure taxonomy surfaced to callers. The numeric codes are stable and match the platform's
///  satellite result codes, so they can be passed through to other layers unchanged.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum SatelliteError {
    Error = 1,
    ServerError = 2,
    ServiceError = 3,
    ModemError = 4,
    NetworkError = 5,
    /// the engine could not even attempt the request, e.g. there is no transport
    InvalidTelephonyState = 6,
    InvalidModemState = 7,
    InvalidArguments = 8,
    RequestFailed = 9,
    RadioNotAvailable = 10,
    RequestNotSupported = 11,
    NoResources = 12,
    ServiceNotProvisioned = 13,
    ServiceProvisionInProgress = 14,
    /// the request was dropped because another request failed or the modem went away
    RequestAborted = 15,
    AccessBarred = 16,
    NetworkTimeout = 17,
    /// demo mode: the device was not aligned with the satellite in time
    NotReachable = 18,
    NotAuthorized = 19,
    NotSupported = 20,
    RequestInProgress = 21,
    /// the opposite transfer direction is active
    ModemBusy = 22,
    IllegalState = 23,
    ModemTimeout = 24,
}

impl Display for SatelliteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, i32::from(*self))
    }
}

impl std::error::Error for SatelliteError {}

pub type SatelliteResult<T = ()> = Result<T, SatelliteError>;

pub fn result_code<T>(result: &SatelliteResult<T>) -> i32 {
    match result {
        Ok(_) => SUCCESS_CODE,
        Err(e) => (*e).into(),
    }
}

/// Unknown non-zero codes map to the generic [SatelliteError::Error].
pub fn from_result_code(code: i32) -> SatelliteResult {
    if code == SUCCESS_CODE {
        return Ok(());
    }
    Err(SatelliteError::try_from(code)
        .unwrap_or(SatelliteError::Error))
}
