use std::time::Duration;

use thiserror::Error;

use crate::memory::RegionOperation;
use crate::status::{DfuState, DfuStatusCode};

/// Failure of the underlying USB transfer primitives.
///
/// Carries no protocol knowledge. A failed transfer must be treated as not
/// having been (even partially) applied by the device.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("control transfer stalled")]
    Stalled,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer timed out")]
    Timeout,

    #[error("interface is claimed by another session")]
    Busy,

    #[error("device is not open")]
    NotOpen,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("{0}")]
    Other(String),
}

impl From<nusb::transfer::TransferError> for TransportError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError;
        match err {
            TransferError::Stall => TransportError::Stalled,
            TransferError::Disconnected => TransportError::Disconnected,
            // nusb cancels transfers whose timeout elapsed
            TransferError::Cancelled => TransportError::Timeout,
            other => TransportError::Other(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("DFU status error: {status}, state={state}")]
    Device { status: DfuStatusCode, state: DfuState },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported region: cannot {operation} at {address:#010x}")]
    UnsupportedRegion {
        address: u32,
        operation: RegionOperation,
    },

    #[error("no state progress after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no DFU interface matches the selection")]
    NoDfuInterface,

    #[error("no compatible memory segments")]
    NoMemorySegments,

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
}

const STALL_RECOVERY_HINTS: &[&str] = &[
    "This error (status 15) often occurs due to timing issues or incompatible transfer sizes.",
    "Try the following:",
    "1. Disconnect and reconnect your device",
    "2. If available, put your device in bootloader mode manually",
    "3. Try using a different USB port or cable",
];

impl DfuError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        DfuError::MalformedDescriptor(msg.into())
    }

    pub(crate) fn unexpected_state(operation: &str, state: DfuState) -> Self {
        DfuError::ProtocolViolation(format!(
            "{operation} is not permitted in state {state}"
        ))
    }

    /// Only a stalled control pipe (or the device reporting
    /// `errSTALLEDPKT`) is retried automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DfuError::Transport(TransportError::Stalled)
                | DfuError::Device {
                    status: DfuStatusCode::ErrStalledPkt,
                    ..
                }
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, DfuError::Transport(TransportError::Disconnected))
    }

    /// Device status code attached to this error, if any.
    pub fn status_code(&self) -> Option<DfuStatusCode> {
        match self {
            DfuError::Device { status, .. } => Some(*status),
            DfuError::Transport(TransportError::Stalled) => {
                Some(DfuStatusCode::ErrStalledPkt)
            }
            _ => None,
        }
    }

    /// Actionable guidance for the user, for the failure modes where
    /// there is something to suggest.
    pub fn recovery_hints(&self) -> Option<&'static [&'static str]> {
        if self.status_code() == Some(DfuStatusCode::ErrStalledPkt) {
            Some(STALL_RECOVERY_HINTS)
        } else {
            None
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Transport(TransportError::Usb(err))
    }
}
