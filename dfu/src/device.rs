use std::time::{Duration, Instant};

use async_io::Timer;
use log::{debug, warn};
use regex::Regex;

use crate::descriptor::{
    ConfigurationDescriptor, DFU_CLASS, DFU_SUBCLASS, UsbDeviceDescriptor,
    parse_configuration_descriptor,
};
use crate::error::DfuError;
use crate::interface::{
    DfuMode, InterfaceAltSetting, backfill_interface_names, dfu_interfaces,
    read_interface_names,
};
use crate::transport::{DfuTransport, NusbTransport};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot of a DFU capable device taken when it was probed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub interfaces: Vec<InterfaceAltSetting>,
}

impl DeviceDescriptor {
    /// Version embedded in the product string (`... v1.2.3`).
    pub fn firmware_version(&self) -> Option<String> {
        let re = Regex::new(r"v(\d+(\.\d+)*)").ok()?;
        re.find(self.product.as_deref()?)
            .map(|m| m.as_str().to_string())
    }

    /// One line description of the device as seen through `intf`.
    pub fn summary(&self, intf: &InterfaceAltSetting) -> String {
        format!(
            "{}: [{:04x}:{:04x}] cfg={}, intf={}, alt={}, name=\"{}\" serial=\"{}\"",
            intf.mode(),
            self.vendor_id,
            self.product_id,
            intf.configuration,
            intf.interface,
            intf.alt_setting,
            self.product.as_deref().unwrap_or("UNKNOWN"),
            self.serial_number.as_deref().unwrap_or("UNKNOWN"),
        )
    }
}

/// Everything read from the device while probing.
#[derive(Clone, Debug)]
pub struct DeviceProbe {
    pub descriptor: DeviceDescriptor,
    pub device: UsbDeviceDescriptor,
    pub configurations: Vec<ConfigurationDescriptor>,
}

/// Read and decode the descriptors of an opened device.
///
/// Interface names are resolved in a second step over the same handle,
/// reading each string once.
pub async fn probe<T: DfuTransport>(
    transport: &mut T,
) -> Result<DeviceProbe, DfuError> {
    let device =
        UsbDeviceDescriptor::parse(&transport.device_descriptor().await?)?;
    let mut configurations =
        Vec::with_capacity(usize::from(device.num_configurations));
    for index in 0..device.num_configurations {
        let raw = transport.configuration_descriptor(index).await?;
        configurations.push(parse_configuration_descriptor(&raw)?);
    }

    let mut interfaces = dfu_interfaces(&configurations);
    if interfaces.iter().any(|i| i.name.is_none()) {
        let names = read_interface_names(transport, &interfaces).await;
        backfill_interface_names(&mut interfaces, &names);
    }

    let descriptor = DeviceDescriptor {
        vendor_id: device.vendor_id,
        product_id: device.product_id,
        manufacturer: transport
            .string_descriptor(device.manufacturer_index)
            .await,
        product: transport.string_descriptor(device.product_index).await,
        serial_number: transport
            .string_descriptor(device.serial_number_index)
            .await,
        interfaces,
    };
    Ok(DeviceProbe {
        descriptor,
        device,
        configurations,
    })
}

/// DFU device found on the bus
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    descriptor: DeviceDescriptor,
}

impl DfuDevice {
    async fn from_device_info(dev: nusb::DeviceInfo) -> Result<Self, DfuError> {
        // temporary handle, only used to read the descriptors
        let mut transport = NusbTransport::new(dev.clone());
        transport.open().await?;
        let probed = probe(&mut transport).await;
        transport.close().await;
        let descriptor = probed?.descriptor;
        Ok(DfuDevice { dev, descriptor })
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.dev.id()
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &[InterfaceAltSetting] {
        &self.descriptor.interfaces
    }

    /// Fresh, unopened transport for a session on this device.
    pub fn transport(&self) -> NusbTransport {
        NusbTransport::new(self.dev.clone())
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

pub async fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .await?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        let (vid, pid) = (device.vendor_id(), device.product_id());
        match DfuDevice::from_device_info(device).await {
            Ok(dfu_device) => dfu_devices.push(dfu_device),
            Err(e) => warn!("skipping {vid:04x}:{pid:04x}: {e}"),
        }
    }
    Ok(dfu_devices)
}

/// Poll the bus until a matching device in DFU mode shows up, e.g. after a
/// detach.
pub async fn wait_for_device(
    vid: Option<u16>,
    pid: Option<u16>,
    timeout: Duration,
) -> Result<DfuDevice, DfuError> {
    let start = Instant::now();
    loop {
        let devices = find_dfu_devices(vid, pid).await?;
        if let Some(device) = devices.into_iter().find(|d| {
            d.interfaces().iter().any(|i| i.mode() == DfuMode::Dfu)
        }) {
            return Ok(device);
        }
        if start.elapsed() >= timeout {
            return Err(DfuError::Timeout(timeout));
        }
        debug!("no DFU device yet");
        Timer::after(DEVICE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::transport::{MockDeviceConfig, MockTransport};

    #[test]
    fn test_probe_mock_device() {
        let mut transport =
            MockTransport::new(MockDeviceConfig::dfu(1024, true));
        let probed = block_on(async {
            transport.open().await.unwrap();
            probe(&mut transport).await.unwrap()
        });
        let desc = &probed.descriptor;
        assert_eq!((desc.vendor_id, desc.product_id), (0x2fe3, 0x0100));
        assert_eq!(desc.interfaces.len(), 1);
        assert_eq!(desc.interfaces[0].name.as_deref(), Some("image-0"));
        assert_eq!(desc.firmware_version().as_deref(), Some("v1.2.3"));
        assert_eq!(
            desc.summary(&desc.interfaces[0]),
            "DFU: [2fe3:0100] cfg=1, intf=0, alt=0, name=\"Test Board v1.2.3\" serial=\"0123456789\""
        );
        assert_eq!(probed.configurations.len(), 1);
        assert_eq!(
            probed.device.to_bytes(),
            block_on(transport.device_descriptor()).unwrap()
        );
    }
}
