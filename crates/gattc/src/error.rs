//! Error types for the gattc library
//!
//! Every fallible GATT client operation reports one of these statuses, either
//! as a synchronous return value or through an application callback.

use crate::att::AttErrorCode;
use thiserror::Error;

/// Status taxonomy of the GATT client
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattError {
    #[error("Invalid parameter")]
    InvalidParameter,

    #[error("Handle, service or characteristic not found")]
    NotFound,

    #[error("No application is mapped to this connection")]
    RequestNotSupported,

    #[error("Device busy")]
    DeviceBusy,

    #[error("Maximum number of applications reached")]
    MaxApplications,

    #[error("Device already bound to an exclusive application")]
    DeviceAlreadyBind,

    #[error("ATT error: {0}")]
    Att(AttErrorCode),

    #[error("GATT client dispatcher stopped")]
    DispatcherStopped,

    #[error("Synchronous call issued from the dispatcher thread")]
    Reentrant,
}

impl From<AttErrorCode> for GattError {
    fn from(code: AttErrorCode) -> Self {
        GattError::Att(code)
    }
}

impl GattError {
    /// Numeric status, for logging and interop with integer-status callers.
    ///
    /// Local statuses live above the ATT error code space.
    pub fn code(&self) -> u16 {
        match self {
            GattError::Att(code) => u8::from(*code) as u16,
            GattError::InvalidParameter => 0x0101,
            GattError::NotFound => 0x0102,
            GattError::RequestNotSupported => 0x0103,
            GattError::DeviceBusy => 0x0104,
            GattError::MaxApplications => 0x0105,
            GattError::DeviceAlreadyBind => 0x0106,
            GattError::DispatcherStopped => 0x0107,
            GattError::Reentrant => 0x0108,
        }
    }
}

/// Result type for GATT client operations
pub type GattResult<T> = Result<T, GattError>;
