use std::fmt;
use std::time::Duration;

use crate::error::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// Device state as defined in section 6.1.2 of the DFU 1.1 specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DfuDnloadSync,
    DfuDnbusy,
    DfuDnloadIdle,
    DfuManifestSync,
    DfuManifest,
    DfuManifestWaitReset,
    DfuUploadIdle,
    DfuError,
}

impl DfuState {
    pub const ALL: [DfuState; 11] = [
        DfuState::AppIdle,
        DfuState::AppDetach,
        DfuState::DfuIdle,
        DfuState::DfuDnloadSync,
        DfuState::DfuDnbusy,
        DfuState::DfuDnloadIdle,
        DfuState::DfuManifestSync,
        DfuState::DfuManifest,
        DfuState::DfuManifestWaitReset,
        DfuState::DfuUploadIdle,
        DfuState::DfuError,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_manifesting(self) -> bool {
        matches!(
            self,
            DfuState::DfuManifestSync
                | DfuState::DfuManifest
                | DfuState::DfuManifestWaitReset
        )
    }

    pub fn is_runtime(self) -> bool {
        matches!(self, DfuState::AppIdle | DfuState::AppDetach)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DfuDnbusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST-SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        };
        f.write_str(name)
    }
}

/// `bStatus` values (DFU 1.1 section 6.1.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl DfuStatusCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0a => DfuStatusCode::ErrFirmware,
            0x0b => DfuStatusCode::ErrVendor,
            0x0c => DfuStatusCode::ErrUsbReset,
            0x0d => DfuStatusCode::ErrPowerOnReset,
            0x0e => DfuStatusCode::ErrUnknown,
            0x0f => DfuStatusCode::ErrStalledPkt,
            other => DfuStatusCode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DfuStatusCode::Ok => 0x00,
            DfuStatusCode::ErrTarget => 0x01,
            DfuStatusCode::ErrFile => 0x02,
            DfuStatusCode::ErrWrite => 0x03,
            DfuStatusCode::ErrErase => 0x04,
            DfuStatusCode::ErrCheckErased => 0x05,
            DfuStatusCode::ErrProg => 0x06,
            DfuStatusCode::ErrVerify => 0x07,
            DfuStatusCode::ErrAddress => 0x08,
            DfuStatusCode::ErrNotDone => 0x09,
            DfuStatusCode::ErrFirmware => 0x0a,
            DfuStatusCode::ErrVendor => 0x0b,
            DfuStatusCode::ErrUsbReset => 0x0c,
            DfuStatusCode::ErrPowerOnReset => 0x0d,
            DfuStatusCode::ErrUnknown => 0x0e,
            DfuStatusCode::ErrStalledPkt => 0x0f,
            DfuStatusCode::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == DfuStatusCode::Ok
    }

    pub fn description(self) -> &'static str {
        match self {
            DfuStatusCode::Ok => "No error",
            DfuStatusCode::ErrTarget => "Target error",
            DfuStatusCode::ErrFile => "File error",
            DfuStatusCode::ErrWrite => "Write error",
            DfuStatusCode::ErrErase => "Erase error",
            DfuStatusCode::ErrCheckErased => "Check erased error",
            DfuStatusCode::ErrProg => "Programming error",
            DfuStatusCode::ErrVerify => "Verify error",
            DfuStatusCode::ErrAddress => "Address error",
            DfuStatusCode::ErrNotDone => "Not done error",
            DfuStatusCode::ErrFirmware => "Firmware error",
            DfuStatusCode::ErrVendor => "Vendor error",
            DfuStatusCode::ErrUsbReset => "USB error",
            DfuStatusCode::ErrPowerOnReset => "POR error",
            DfuStatusCode::ErrUnknown => "Unknown error",
            DfuStatusCode::ErrStalledPkt => {
                "Stalled packet error (try resetting device)"
            }
            DfuStatusCode::Unknown(_) => "Unknown error code",
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status={})", self.description(), self.as_u8())
    }
}

/// Response to `DFU_GETSTATUS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: DfuStatusCode,
    /// Minimum time in milliseconds before the next `DFU_GETSTATUS`
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DeviceStatus {
    pub fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < usize::from(DFU_STATUS_LEN) {
            return Err(DfuError::ProtocolViolation(format!(
                "short GETSTATUS response ({} bytes)",
                data.len()
            )));
        }
        let state = DfuState::from_u8(data[4]).ok_or_else(|| {
            DfuError::ProtocolViolation(format!(
                "unknown DFU state {}",
                data[4]
            ))
        })?;
        Ok(DeviceStatus {
            status: DfuStatusCode::from_u8(data[0]),
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state,
            string_index: data[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let timeout = self.poll_timeout.to_le_bytes();
        [
            self.status.as_u8(),
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.as_u8(),
            self.string_index,
        ]
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_timeout))
    }

    pub fn is_error(&self) -> bool {
        !self.status.is_ok() || self.state == DfuState::DfuError
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.is_error() {
            Err(DfuError::from(self))
        } else {
            Ok(t)
        }
    }
}

impl From<&DeviceStatus> for DfuError {
    fn from(st: &DeviceStatus) -> Self {
        DfuError::Device {
            status: st.status,
            state: st.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw() {
        let st = DeviceStatus::from_raw(&[0x0f, 0x10, 0x27, 0x00, 0x0a, 0x00])
            .unwrap();
        assert_eq!(st.status, DfuStatusCode::ErrStalledPkt);
        assert_eq!(st.poll_timeout, 10_000);
        assert_eq!(st.state, DfuState::DfuError);
        assert!(st.is_error());
        assert_eq!(st.to_bytes(), [0x0f, 0x10, 0x27, 0x00, 0x0a, 0x00]);
    }

    #[test]
    fn test_status_rejects_short_or_unknown_state() {
        assert!(matches!(
            DeviceStatus::from_raw(&[0, 0, 0]),
            Err(DfuError::ProtocolViolation(_))
        ));
        assert!(matches!(
            DeviceStatus::from_raw(&[0, 0, 0, 0, 42, 0]),
            Err(DfuError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_state_codes() {
        for (code, state) in DfuState::ALL.iter().enumerate() {
            assert_eq!(DfuState::from_u8(code as u8), Some(*state));
            assert_eq!(state.as_u8(), code as u8);
        }
        assert_eq!(DfuState::from_u8(11), None);
    }

    #[test]
    fn test_status_description() {
        assert_eq!(
            DfuStatusCode::from_u8(0x0f).to_string(),
            "Stalled packet error (try resetting device) (status=15)"
        );
        assert_eq!(DfuStatusCode::from_u8(0x42), DfuStatusCode::Unknown(0x42));
        assert_eq!(DfuStatusCode::Unknown(0x42).as_u8(), 0x42);
    }
}
