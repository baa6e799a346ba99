use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::descriptor::{
    ConfigurationDescriptor, DFU_PROTOCOL_DFU, DFU_PROTOCOL_RUNTIME,
};
use crate::memory::{MemoryMap, parse_memory_layout};
use crate::transport::DfuTransport;

/// Key of an alternate setting: configuration value, interface number and
/// alternate setting.
pub type AltSettingKey = (u8, u8, u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuMode {
    Runtime,
    Dfu,
    Unknown,
}

impl fmt::Display for DfuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DfuMode::Runtime => "Runtime",
            DfuMode::Dfu => "DFU",
            DfuMode::Unknown => "Unknown",
        })
    }
}

/// One selectable DFU interface alternate setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceAltSetting {
    pub configuration: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    /// `None` until the string descriptor has been read
    pub name: Option<String>,
}

impl InterfaceAltSetting {
    pub fn key(&self) -> AltSettingKey {
        (self.configuration, self.interface, self.alt_setting)
    }

    pub fn mode(&self) -> DfuMode {
        match self.protocol {
            DFU_PROTOCOL_RUNTIME => DfuMode::Runtime,
            DFU_PROTOCOL_DFU => DfuMode::Dfu,
            _ => DfuMode::Unknown,
        }
    }

    /// DfuSe memory layout encoded in the interface name, if any.
    pub fn memory_map(&self) -> Option<MemoryMap> {
        parse_memory_layout(self.name.as_deref()?)
    }
}

impl fmt::Display for InterfaceAltSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: cfg={}, intf={}, alt={}, name=\"{}\"",
            self.mode(),
            self.configuration,
            self.interface,
            self.alt_setting,
            self.name.as_deref().unwrap_or("UNKNOWN")
        )
    }
}

/// All DFU class alternate settings, names not yet resolved.
pub fn dfu_interfaces(
    configurations: &[ConfigurationDescriptor],
) -> Vec<InterfaceAltSetting> {
    configurations
        .iter()
        .flat_map(|config| {
            config
                .alt_settings
                .iter()
                .filter(|alt| alt.is_dfu())
                .map(|alt| InterfaceAltSetting {
                    configuration: config.configuration_value,
                    interface: alt.interface_number,
                    alt_setting: alt.alternate_setting,
                    class: alt.class,
                    subclass: alt.subclass,
                    protocol: alt.protocol,
                    string_index: alt.string_index,
                    name: None,
                })
        })
        .collect()
}

/// Read the name string of every alternate setting that has one.
///
/// Each string index is requested once.
pub async fn read_interface_names<T: DfuTransport>(
    transport: &mut T,
    interfaces: &[InterfaceAltSetting],
) -> HashMap<AltSettingKey, String> {
    let mut strings: HashMap<u8, Option<String>> = HashMap::new();
    let mut names = HashMap::new();
    for intf in interfaces.iter().filter(|i| i.string_index != 0) {
        if !strings.contains_key(&intf.string_index) {
            let s = transport.string_descriptor(intf.string_index).await;
            strings.insert(intf.string_index, s);
        }
        if let Some(Some(name)) = strings.get(&intf.string_index) {
            names.insert(intf.key(), name.clone());
        }
    }
    debug!("resolved {} interface names", names.len());
    names
}

/// Fill in missing names from `names`. Existing names are kept.
pub fn backfill_interface_names(
    interfaces: &mut [InterfaceAltSetting],
    names: &HashMap<AltSettingKey, String>,
) {
    for intf in interfaces.iter_mut().filter(|i| i.name.is_none()) {
        intf.name = names.get(&intf.key()).cloned();
    }
}

/// Which alternate setting a session should use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InterfaceSelector {
    /// First DFU mode setting, or the first setting of any mode
    #[default]
    First,
    /// Position in the device's interface list
    Index(usize),
    Setting { interface: u8, alt_setting: u8 },
    /// Interface name, or the name of its DfuSe memory region
    Name(String),
}

impl InterfaceSelector {
    pub fn select<'a>(
        &self,
        interfaces: &'a [InterfaceAltSetting],
    ) -> Option<&'a InterfaceAltSetting> {
        match self {
            InterfaceSelector::First => interfaces
                .iter()
                .find(|i| i.mode() == DfuMode::Dfu)
                .or_else(|| interfaces.first()),
            InterfaceSelector::Index(i) => interfaces.get(*i),
            InterfaceSelector::Setting {
                interface,
                alt_setting,
            } => interfaces.iter().find(|i| {
                i.interface == *interface && i.alt_setting == *alt_setting
            }),
            InterfaceSelector::Name(name) => interfaces.iter().find(|i| {
                i.name.as_deref() == Some(name.as_str())
                    || i.memory_map().is_some_and(|m| m.name == *name)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_configuration_descriptor;

    const CONFIG: &[u8] = &[
        0x09, 0x02, 0x2d, 0x00, 0x01, 0x01, 0x00, 0xc0, 0x32, // config
        0x09, 0x04, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, // HID
        0x09, 0x04, 0x01, 0x00, 0x00, 0xfe, 0x01, 0x02, 0x04, // DFU alt 0
        0x09, 0x04, 0x01, 0x01, 0x00, 0xfe, 0x01, 0x02, 0x00, // DFU alt 1
        0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01, // functional
    ];

    fn interfaces() -> Vec<InterfaceAltSetting> {
        let config = parse_configuration_descriptor(CONFIG).unwrap();
        dfu_interfaces(&[config])
    }

    #[test]
    fn test_dfu_interfaces() {
        let interfaces = interfaces();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].key(), (1, 1, 0));
        assert_eq!(interfaces[1].key(), (1, 1, 1));
        assert_eq!(interfaces[0].mode(), DfuMode::Dfu);
        assert_eq!(
            interfaces[1].to_string(),
            "DFU: cfg=1, intf=1, alt=1, name=\"UNKNOWN\""
        );
    }

    #[test]
    fn test_backfill_and_select() {
        let mut interfaces = interfaces();
        interfaces[1].name = Some("@SPI Flash /0x90000000/64*4Kg".into());
        let names = HashMap::from([
            ((1, 1, 0), "@Internal Flash /0x08000000/8*08Kg".to_string()),
            ((1, 1, 1), "ignored".to_string()),
        ]);
        backfill_interface_names(&mut interfaces, &names);
        assert_eq!(
            interfaces[0].name.as_deref(),
            Some("@Internal Flash /0x08000000/8*08Kg")
        );
        assert_eq!(
            interfaces[1].name.as_deref(),
            Some("@SPI Flash /0x90000000/64*4Kg")
        );

        let sel = InterfaceSelector::Name("SPI Flash".into());
        assert_eq!(sel.select(&interfaces).map(|i| i.alt_setting), Some(1));
        let sel = InterfaceSelector::Setting {
            interface: 1,
            alt_setting: 0,
        };
        assert_eq!(sel.select(&interfaces).map(|i| i.alt_setting), Some(0));
        assert_eq!(InterfaceSelector::Index(5).select(&interfaces), None);
        assert_eq!(
            InterfaceSelector::First.select(&interfaces).map(|i| i.key()),
            Some((1, 1, 0))
        );
        assert_eq!(
            interfaces[0].memory_map().map(|m| m.start_address()),
            Some(0x08000000)
        );
    }
}
