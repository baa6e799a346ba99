//! Firmware containers used with DFU devices.
//!
//! A `.dfu` file is the firmware followed by a 16 byte suffix
//! (DFU 1.1, appendix B). For DfuSe devices the firmware itself is a
//! `DfuSe` image made of targets (one per alternate setting), each holding
//! addressed elements (UM0391).

pub use iter::*;

mod iter;

use crc::{CRC_32_JAMCRC, Crc};
use thiserror::Error;

pub const DFU_SUFFIX_LEN: usize = 16;
pub const DFU_SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";

pub const DFUSE_PREFIX_LEN: usize = 11;
pub const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
pub const DFUSE_VERSION: u8 = 0x01;

pub const DFUSE_TARGET_PREFIX_LEN: usize = 274;
pub const DFUSE_TARGET_SIGNATURE: &[u8; 6] = b"Target";
pub const DFUSE_TARGET_NAME_LEN: usize = 255;
pub const DFUSE_ELEMENT_HEADER_LEN: usize = 8;

/// bcdDFU of files carrying a DfuSe image
pub const DFUSE_BCD: u16 = 0x011a;

// crc32 without the final inversion, as dfu-util computes it
const SUFFIX_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DfuFileError {
    #[error("file too short ({0} bytes)")]
    TooShort(usize),

    #[error("invalid DFU suffix: {0}")]
    InvalidSuffix(String),

    #[error("invalid DfuSe prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid DfuSe target {index}: {reason}")]
    InvalidTarget { index: usize, reason: String },

    #[error("truncated DfuSe image at offset {0}")]
    Truncated(usize),
}

/// The trailing DFU suffix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuSuffix {
    pub device: u16,
    pub product_id: u16,
    pub vendor_id: u16,
    pub dfu_version: u16,
    pub length: u8,
    pub crc: u32,
}

impl DfuSuffix {
    pub const ANY_ID: u16 = 0xffff;

    pub fn decode(data: &[u8]) -> Result<DfuSuffix, DfuFileError> {
        if data.len() < DFU_SUFFIX_LEN {
            return Err(DfuFileError::TooShort(data.len()));
        }
        let suffix = &data[data.len() - DFU_SUFFIX_LEN..];
        if &suffix[8..11] != DFU_SUFFIX_SIGNATURE {
            return Err(DfuFileError::InvalidSuffix(
                "signature mismatch".into(),
            ));
        }
        let length = suffix[11];
        if usize::from(length) < DFU_SUFFIX_LEN
            || usize::from(length) > data.len()
        {
            return Err(DfuFileError::InvalidSuffix(format!(
                "bad suffix length {length}"
            )));
        }
        Ok(DfuSuffix {
            device: extract_u16(suffix, 0),
            product_id: extract_u16(suffix, 2),
            vendor_id: extract_u16(suffix, 4),
            dfu_version: extract_u16(suffix, 6),
            length,
            crc: extract_u32(suffix, 12),
        })
    }

    /// Whether the file was built for `vid:pid`; `0xffff` matches any id.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        (self.vendor_id == Self::ANY_ID || self.vendor_id == vid)
            && (self.product_id == Self::ANY_ID || self.product_id == pid)
    }
}

/// One addressed chunk of a DfuSe image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuseElement {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Image for one alternate setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuseTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<DfuseElement>,
}

impl DfuseTarget {
    pub fn size(&self) -> usize {
        self.elements.iter().map(|e| e.data.len()).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Raw(Vec<u8>),
    Dfuse(Vec<DfuseTarget>),
}

/// A decoded firmware file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuFile {
    /// `None` for plain binaries
    pub suffix: Option<DfuSuffix>,
    pub payload: Payload,
}

impl DfuFile {
    /// Decode `data`.
    ///
    /// Files without a suffix are taken as raw binaries. A suffix with
    /// bcdDFU 0x011a, or a payload starting with the DfuSe signature, is
    /// decoded as a DfuSe image.
    pub fn decode(data: &[u8]) -> Result<DfuFile, DfuFileError> {
        if !has_dfu_suffix(data) {
            if is_dfuse_payload(data) {
                return Ok(DfuFile {
                    suffix: None,
                    payload: Payload::Dfuse(decode_dfuse(data)?),
                });
            }
            return Ok(DfuFile {
                suffix: None,
                payload: Payload::Raw(data.to_vec()),
            });
        }

        let suffix = DfuSuffix::decode(data)?;
        let firmware = &data[..data.len() - usize::from(suffix.length)];
        let payload =
            if suffix.dfu_version == DFUSE_BCD || is_dfuse_payload(firmware) {
                Payload::Dfuse(decode_dfuse(firmware)?)
            } else {
                Payload::Raw(firmware.to_vec())
            };
        Ok(DfuFile {
            suffix: Some(suffix),
            payload,
        })
    }

    pub fn is_dfuse(&self) -> bool {
        matches!(self.payload, Payload::Dfuse(_))
    }

    /// Number of firmware bytes, excluding all container headers.
    pub fn firmware_size(&self) -> usize {
        match &self.payload {
            Payload::Raw(data) => data.len(),
            Payload::Dfuse(targets) => targets.iter().map(|t| t.size()).sum(),
        }
    }

    /// Target for alternate setting `alt`, or the first one.
    pub fn target(&self, alt: Option<u8>) -> Option<&DfuseTarget> {
        match &self.payload {
            Payload::Raw(_) => None,
            Payload::Dfuse(targets) => match alt {
                Some(alt) => targets.iter().find(|t| t.alt_setting == alt),
                None => targets.first(),
            },
        }
    }
}

pub fn has_dfu_suffix(data: &[u8]) -> bool {
    data.len() >= DFU_SUFFIX_LEN
        && &data[data.len() - 8..data.len() - 5] == DFU_SUFFIX_SIGNATURE
}

pub fn is_dfuse_payload(data: &[u8]) -> bool {
    data.starts_with(DFUSE_SIGNATURE)
}

/// CRC over everything but the CRC field itself.
pub fn compute_crc(data: &[u8]) -> Option<u32> {
    let covered = data.len().checked_sub(4)?;
    Some(SUFFIX_CRC.checksum(&data[..covered]))
}

/// Compare the suffix CRC with the file contents.
pub fn verify_crc(data: &[u8]) -> Result<(), DfuFileError> {
    let suffix = DfuSuffix::decode(data)?;
    match compute_crc(data) {
        Some(crc) if crc == suffix.crc => Ok(()),
        Some(crc) => Err(DfuFileError::InvalidSuffix(format!(
            "CRC mismatch: file {:#010x}, computed {crc:#010x}",
            suffix.crc
        ))),
        None => Err(DfuFileError::TooShort(data.len())),
    }
}

/// Decode a DfuSe image (prefix and targets, without suffix).
pub fn decode_dfuse(data: &[u8]) -> Result<Vec<DfuseTarget>, DfuFileError> {
    DfuseTargetIterator::new(data)?.collect()
}

pub(crate) fn extract_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn extract_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
