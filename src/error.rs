//! ## USBTMC Errors
//!
//! The errors used throughout the crate.
//!

use crate::constants::usbtmc_status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no matching device found")]
    DeviceNotFound,
    #[error("device is not compatible with USBTMC")]
    DeviceIncompatible,
    #[error("usbtmc interface not found")]
    InterfaceNotFound,
    #[error("usbtmc interface setting not found")]
    InterfaceSettingNotFound,
    #[error("bulk out endpoint not found")]
    BulkOutEndpointNotFound,
    #[error("bulk in endpoint not found")]
    BulkInEndpointNotFound,
    #[error("device has been disconnected")]
    NotPresent,
    #[error("scratch buffer allocation failed")]
    Alloc,
    #[error("timeout shorter than the minimum of 500 ms")]
    TimeoutTooShort,
    #[error("end-of-message enable accepts only 0 or 1")]
    InvalidEomValue,
    #[error("device does not report the required capability")]
    UnsupportedFeature,
    #[error("device reply carries the wrong message id")]
    InvalidMsgId,
    #[error("device reply carries the wrong bTag")]
    TagMismatch,
    #[error("device announced more data than was requested")]
    TransferTooLarge,
    #[error("first bulk-in packet shorter than a USBTMC header")]
    TruncatedHeader,
    #[error("control reply shorter than expected")]
    TruncatedControlResponse,
    #[error("bulk out transfer made no progress")]
    StalledBulkOut,
    #[error("device reported STATUS_FAILED")]
    StatusFailure,
    #[error("device reported unexpected status 0x{0:02x}")]
    UnexpectedStatus(u8),
    #[error("bulk-in endpoint still full after {0} drain reads")]
    DrainLimitExceeded(usize),
    #[error("timed out waiting for a device notification")]
    WaitTimeout,
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
}

impl Error {
    /// Map a non-SUCCESS status byte from a control reply to an error.
    pub(crate) fn from_status(status: u8) -> Error {
        match status {
            usbtmc_status::STATUS_FAILED => Error::StatusFailure,
            other => Error::UnexpectedStatus(other),
        }
    }
}
