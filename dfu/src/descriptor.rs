//! Decoding of raw USB descriptors.
//!
//! Everything here is a pure function over byte buffers as returned by
//! `GET_DESCRIPTOR`, so it can be exercised with captured descriptors.

use std::collections::BTreeMap;

use crate::error::DfuError;

pub(crate) const DESC_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESC_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESC_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DFU_DESC_TYPE: u8 = 0x21;

const DEVICE_DESC_LEN: usize = 18;
const CONFIG_DESC_LEN: usize = 9;
const INTERFACE_DESC_LEN: usize = 9;
pub(crate) const DFU_DESC_LEN: usize = 9;
// DFU 1.0 functional descriptors stop before bcdDFUVersion
const DFU_DESC_MIN_LEN: usize = 7;

pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU: u8 = 0x02;

pub const DFU_VERSION_NUMBER: u16 = 0x0100;
pub const DFUSE_VERSION_NUMBER: u16 = 0x011A;

/// A single descriptor (`bLength`, `bDescriptorType`, payload) kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDescriptor {
    bytes: Vec<u8>,
}

impl RawDescriptor {
    pub fn descriptor_type(&self) -> u8 {
        self.bytes[1]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Standard device descriptor (USB 2.0 section 9.6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl UsbDeviceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DEVICE_DESC_LEN {
            return Err(DfuError::malformed(format!(
                "device descriptor truncated ({} bytes)",
                data.len()
            )));
        }
        if usize::from(data[0]) < DEVICE_DESC_LEN
            || data[1] != DESC_TYPE_DEVICE
        {
            return Err(DfuError::malformed("not a device descriptor"));
        }
        Ok(UsbDeviceDescriptor {
            usb_version: le16(data, 2),
            class: data[4],
            subclass: data[5],
            protocol: data[6],
            max_packet_size0: data[7],
            vendor_id: le16(data, 8),
            product_id: le16(data, 10),
            device_version: le16(data, 12),
            manufacturer_index: data[14],
            product_index: data[15],
            serial_number_index: data[16],
            num_configurations: data[17],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![DEVICE_DESC_LEN as u8, DESC_TYPE_DEVICE];
        out.extend_from_slice(&self.usb_version.to_le_bytes());
        out.extend_from_slice(&[
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size0,
        ]);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.product_id.to_le_bytes());
        out.extend_from_slice(&self.device_version.to_le_bytes());
        out.extend_from_slice(&[
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
            self.num_configurations,
        ]);
        out
    }
}

/// One interface descriptor together with the class/endpoint descriptors
/// following it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltSettingDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    header: RawDescriptor,
    pub descriptors: Vec<RawDescriptor>,
}

impl AltSettingDescriptor {
    fn parse(header: RawDescriptor) -> Result<Self, DfuError> {
        let b = header.as_bytes();
        if b.len() < INTERFACE_DESC_LEN {
            return Err(DfuError::malformed(format!(
                "interface descriptor too short ({} bytes)",
                b.len()
            )));
        }
        Ok(AltSettingDescriptor {
            interface_number: b[2],
            alternate_setting: b[3],
            num_endpoints: b[4],
            class: b[5],
            subclass: b[6],
            protocol: b[7],
            string_index: b[8],
            descriptors: Vec::new(),
            header,
        })
    }

    pub fn is_dfu(&self) -> bool {
        self.class == DFU_CLASS && self.subclass == DFU_SUBCLASS
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    header: RawDescriptor,
    /// Descriptors between the configuration header and the first interface
    pub extra: Vec<RawDescriptor>,
    /// Interface descriptors in wire order
    pub alt_settings: Vec<AltSettingDescriptor>,
}

impl ConfigurationDescriptor {
    /// Alternate settings grouped by interface number.
    pub fn interfaces(&self) -> BTreeMap<u8, Vec<&AltSettingDescriptor>> {
        let mut interfaces: BTreeMap<u8, Vec<&AltSettingDescriptor>> =
            BTreeMap::new();
        for alt in &self.alt_settings {
            interfaces.entry(alt.interface_number).or_default().push(alt);
        }
        interfaces
    }

    /// The DFU functional descriptor of this configuration.
    ///
    /// Only descriptors attached to DFU class interfaces are considered,
    /// HID uses the same descriptor type.
    pub fn functional_descriptor(&self) -> Option<FunctionalDescriptor> {
        self.alt_settings
            .iter()
            .filter(|alt| alt.is_dfu())
            .flat_map(|alt| alt.descriptors.iter())
            .find(|desc| {
                desc.descriptor_type() == DFU_DESC_TYPE
                    && desc.len() >= DFU_DESC_MIN_LEN
            })
            .map(|desc| FunctionalDescriptor::new(desc.as_bytes()))
    }

    /// Re-encode the descriptor set; `wTotalLength` is recomputed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.as_bytes().to_vec();
        for desc in &self.extra {
            out.extend_from_slice(desc.as_bytes());
        }
        for alt in &self.alt_settings {
            out.extend_from_slice(alt.header.as_bytes());
            for desc in &alt.descriptors {
                out.extend_from_slice(desc.as_bytes());
            }
        }
        let total = (out.len() as u16).to_le_bytes();
        out[2] = total[0];
        out[3] = total[1];
        out
    }
}

/// Parse a full configuration descriptor set (header plus every interface,
/// endpoint and class specific descriptor up to `wTotalLength`).
pub fn parse_configuration_descriptor(
    data: &[u8],
) -> Result<ConfigurationDescriptor, DfuError> {
    if data.len() < CONFIG_DESC_LEN {
        return Err(DfuError::malformed(format!(
            "configuration descriptor truncated ({} bytes)",
            data.len()
        )));
    }
    if data[1] != DESC_TYPE_CONFIGURATION {
        return Err(DfuError::malformed(format!(
            "expected configuration descriptor, got type {:#04x}",
            data[1]
        )));
    }
    let header_len = usize::from(data[0]);
    let total_len = usize::from(le16(data, 2));
    if header_len < CONFIG_DESC_LEN || total_len < header_len {
        return Err(DfuError::malformed(format!(
            "inconsistent configuration lengths (bLength={header_len}, wTotalLength={total_len})"
        )));
    }
    if total_len > data.len() {
        return Err(DfuError::malformed(format!(
            "configuration truncated: wTotalLength={total_len}, got {} bytes",
            data.len()
        )));
    }

    let mut descriptors = split_descriptors(&data[..total_len])?.into_iter();
    let header = descriptors
        .next()
        .ok_or_else(|| DfuError::malformed("empty configuration"))?;
    let h = header.as_bytes();
    let mut config = ConfigurationDescriptor {
        configuration_value: h[5],
        string_index: h[6],
        attributes: h[7],
        max_power: h[8],
        header,
        extra: Vec::new(),
        alt_settings: Vec::new(),
    };

    for desc in descriptors {
        if desc.descriptor_type() == DESC_TYPE_INTERFACE {
            config.alt_settings.push(AltSettingDescriptor::parse(desc)?);
        } else if let Some(alt) = config.alt_settings.last_mut() {
            alt.descriptors.push(desc);
        } else {
            config.extra.push(desc);
        }
    }
    Ok(config)
}

/// Functional descriptor of the active configuration.
pub fn find_functional_descriptor(
    configurations: &[ConfigurationDescriptor],
    configuration_value: u8,
) -> Option<FunctionalDescriptor> {
    configurations
        .iter()
        .find(|c| c.configuration_value == configuration_value)
        .and_then(ConfigurationDescriptor::functional_descriptor)
}

fn split_descriptors(data: &[u8]) -> Result<Vec<RawDescriptor>, DfuError> {
    let mut offset = 0;
    let mut descriptors = Vec::new();
    while offset < data.len() {
        if data.len() - offset < 2 {
            return Err(DfuError::malformed(format!(
                "truncated descriptor header at offset {offset}"
            )));
        }
        let len = usize::from(data[offset]);
        if len < 2 {
            return Err(DfuError::malformed(format!(
                "invalid bLength {len} at offset {offset}"
            )));
        }
        if offset + len > data.len() {
            return Err(DfuError::malformed(format!(
                "descriptor at offset {offset} overruns buffer ({len} bytes, {} left)",
                data.len() - offset
            )));
        }
        descriptors.push(RawDescriptor {
            bytes: data[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    Ok(descriptors)
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl FunctionalDescriptor {
    pub const BIT_CAN_DNLOAD: u8 = 1 << 0;
    pub const BIT_CAN_UPLOAD: u8 = 1 << 1;
    pub const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    pub const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Decode from at least [`DFU_DESC_MIN_LEN`] bytes.
    pub(crate) fn new(raw_desc: &[u8]) -> Self {
        let dfu_version = if raw_desc.len() >= DFU_DESC_LEN {
            le16(raw_desc, 7)
        } else {
            DFU_VERSION_NUMBER
        };
        Self {
            attributes: raw_desc[2],
            detach_timeout: le16(raw_desc, 3),
            transfer_size: le16(raw_desc, 5),
            dfu_version,
        }
    }

    pub fn from_parts(
        attributes: u8,
        detach_timeout: u16,
        transfer_size: u16,
        dfu_version: u16,
    ) -> Self {
        Self {
            attributes,
            detach_timeout,
            transfer_size,
            dfu_version,
        }
    }

    /// Used when a device does not expose a functional descriptor at all.
    pub fn fallback() -> Self {
        Self::from_parts(
            Self::BIT_CAN_DNLOAD
                | Self::BIT_CAN_UPLOAD
                | Self::BIT_MANIFESTATION_TOLERANT,
            0,
            crate::DEFAULT_TRANSFER_SIZE,
            DFU_VERSION_NUMBER,
        )
    }

    pub fn to_bytes(&self) -> [u8; DFU_DESC_LEN] {
        let detach = self.detach_timeout.to_le_bytes();
        let xfer = self.transfer_size.to_le_bytes();
        let version = self.dfu_version.to_le_bytes();
        [
            DFU_DESC_LEN as u8,
            DFU_DESC_TYPE,
            self.attributes,
            detach[0],
            detach[1],
            xfer[0],
            xfer[1],
            version[0],
            version[1],
        ]
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a
    /// USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the
    /// `DFU_DETACH` request (`wDetachTimeOut`). If this time elapses without
    /// a USB reset, then the device will terminate the Reconfiguration phase
    /// and revert back to normal operation.
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write
    /// transaction (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification
    /// release (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured from an STM32 system bootloader (two alt settings, functional
    // descriptor after the last one).
    const STM32_CONFIG: &[u8] = &[
        0x09, 0x02, 0x24, 0x00, 0x01, 0x01, 0x00, 0xc0, 0x32, // config
        0x09, 0x04, 0x00, 0x00, 0x00, 0xfe, 0x01, 0x02, 0x04, // alt 0
        0x09, 0x04, 0x00, 0x01, 0x00, 0xfe, 0x01, 0x02, 0x05, // alt 1
        0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01, // functional
    ];

    const DEVICE: &[u8] = &[
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x83, 0x04, 0x11,
        0xdf, 0x00, 0x22, 0x01, 0x02, 0x03, 0x01,
    ];

    #[test]
    fn test_parse_configuration() {
        let config = parse_configuration_descriptor(STM32_CONFIG).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.alt_settings.len(), 2);
        assert_eq!(config.alt_settings[1].alternate_setting, 1);
        assert_eq!(config.alt_settings[1].string_index, 5);
        assert!(config.alt_settings.iter().all(|a| a.is_dfu()));
        assert_eq!(config.interfaces()[&0].len(), 2);

        let func = config.functional_descriptor().unwrap();
        assert!(func.can_download());
        assert!(func.can_upload());
        assert!(!func.manifestation_tolerant());
        assert!(func.will_detach());
        assert_eq!(func.detach_timeout(), 255);
        assert_eq!(func.transfer_size(), 2048);
        assert!(func.is_dfuse());
        assert_eq!(func.to_bytes(), STM32_CONFIG[27..36]);
    }

    #[test]
    fn test_configuration_round_trip() {
        let config = parse_configuration_descriptor(STM32_CONFIG).unwrap();
        assert_eq!(config.to_bytes(), STM32_CONFIG);

        // trailing bytes past wTotalLength are not part of the set
        let mut padded = STM32_CONFIG.to_vec();
        padded.extend_from_slice(&[0, 0, 0]);
        let config = parse_configuration_descriptor(&padded).unwrap();
        assert_eq!(config.to_bytes(), STM32_CONFIG);
    }

    #[test]
    fn test_device_descriptor_round_trip() {
        let dev = UsbDeviceDescriptor::parse(DEVICE).unwrap();
        assert_eq!(dev.vendor_id, 0x0483);
        assert_eq!(dev.product_id, 0xdf11);
        assert_eq!(dev.num_configurations, 1);
        assert_eq!(dev.to_bytes(), DEVICE);
    }

    #[test]
    fn test_truncated_configuration() {
        let err = parse_configuration_descriptor(&STM32_CONFIG[..30]);
        assert!(matches!(err, Err(DfuError::MalformedDescriptor(_))));

        assert!(matches!(
            parse_configuration_descriptor(&STM32_CONFIG[..5]),
            Err(DfuError::MalformedDescriptor(_))
        ));
        assert!(matches!(
            UsbDeviceDescriptor::parse(&DEVICE[..10]),
            Err(DfuError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_inconsistent_lengths() {
        // functional descriptor claims more bytes than wTotalLength covers
        let mut bad = STM32_CONFIG.to_vec();
        bad[27] = 0x0c;
        assert!(matches!(
            parse_configuration_descriptor(&bad),
            Err(DfuError::MalformedDescriptor(_))
        ));

        // zero bLength would never advance
        let mut bad = STM32_CONFIG.to_vec();
        bad[9] = 0x00;
        assert!(matches!(
            parse_configuration_descriptor(&bad),
            Err(DfuError::MalformedDescriptor(_))
        ));

        // interface descriptor shorter than 9 bytes
        let mut bad = STM32_CONFIG[..18].to_vec();
        bad[9] = 0x05;
        bad[2] = 14;
        bad.truncate(14);
        assert!(matches!(
            parse_configuration_descriptor(&bad),
            Err(DfuError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_hid_descriptor_is_not_functional() {
        let config: &[u8] = &[
            0x09, 0x02, 0x1b, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config
            0x09, 0x04, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, // HID
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00, // HID desc
        ];
        let config = parse_configuration_descriptor(config).unwrap();
        assert_eq!(config.functional_descriptor(), None);
    }

    #[test]
    fn test_dfu_1_0_functional_descriptor() {
        let func = FunctionalDescriptor::new(&[
            0x07, 0x21, 0x05, 0xe8, 0x03, 0x00, 0x04,
        ]);
        assert!(func.can_download());
        assert!(func.manifestation_tolerant());
        assert_eq!(func.detach_timeout(), 1000);
        assert_eq!(func.transfer_size(), 1024);
        assert_eq!(func.dfu_version(), DFU_VERSION_NUMBER);
    }
}
