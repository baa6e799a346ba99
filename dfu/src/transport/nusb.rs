//! [`DfuTransport`] on top of a real device, using [`nusb`].

use std::num::NonZeroU8;
use std::pin::pin;
use std::time::Duration;

use async_io::Timer;
use futures::StreamExt;
use futures::future::{self, Either};
use log::{debug, trace};
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};

use super::DfuTransport;
use crate::descriptor::{DESC_TYPE_CONFIGURATION, DESC_TYPE_DEVICE};
use crate::error::TransportError;

pub struct NusbTransport {
    info: nusb::DeviceInfo,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    timeout: Duration,
}

impl NusbTransport {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        Self {
            info,
            device: None,
            interface: None,
            timeout: crate::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn device(&self) -> Result<&nusb::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }

    async fn get_descriptor(
        &self,
        desc_type: u8,
        index: u8,
    ) -> Result<Vec<u8>, TransportError> {
        self.device()?
            .get_descriptor(desc_type, index, 0, self.timeout)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

impl DfuTransport for NusbTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_none() {
            debug!(
                "opening {:04x}:{:04x} on bus {}",
                self.info.vendor_id(),
                self.info.product_id(),
                self.info.bus_id()
            );
            self.device = Some(self.info.open().await?);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.interface = None;
        self.device = None;
    }

    async fn device_descriptor(&mut self) -> Result<Vec<u8>, TransportError> {
        self.get_descriptor(DESC_TYPE_DEVICE, 0).await
    }

    async fn configuration_descriptor(
        &mut self,
        index: u8,
    ) -> Result<Vec<u8>, TransportError> {
        self.get_descriptor(DESC_TYPE_CONFIGURATION, index).await
    }

    async fn string_descriptor(&mut self, index: u8) -> Option<String> {
        let index = NonZeroU8::new(index)?;
        let device = self.device.as_ref()?;
        get_string_descriptor(device, index, self.timeout).await
    }

    fn active_configuration(&self) -> Option<u8> {
        self.device
            .as_ref()?
            .active_configuration()
            .ok()
            .map(|c| c.configuration_value())
    }

    async fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError> {
        if self.active_configuration() == Some(configuration) {
            return Ok(());
        }
        debug!("setting configuration {configuration}");
        self.device()?.set_configuration(configuration).await?;
        Ok(())
    }

    async fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        let claimed =
            self.device()?.detach_and_claim_interface(interface).await?;
        claimed.set_alt_setting(alt_setting).await?;
        self.interface = Some(claimed);
        Ok(())
    }

    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        trace!("OUT req={request} value={value} len={}", data.len());
        Ok(self
            .interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                self.timeout,
            )
            .await?)
    }

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        trace!("IN req={request} value={value} len={length}");
        Ok(self
            .interface()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                self.timeout,
            )
            .await?)
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.device()?.reset().await?;
        // handles do not survive re-enumeration
        self.interface = None;
        self.device = None;
        Ok(())
    }

    async fn wait_disconnected(&mut self, timeout: Duration) -> bool {
        let id = self.info.id();
        let Ok(mut watch) = nusb::watch_devices() else {
            return false;
        };
        let gone = async {
            // the device may already have left before the watch was set up
            if let Ok(mut devices) = nusb::list_devices().await
                && !devices.any(|d| d.id() == id)
            {
                return;
            }
            while let Some(event) = watch.next().await {
                if let HotplugEvent::Disconnected(dev) = event
                    && dev == id
                {
                    return;
                }
            }
            future::pending::<()>().await
        };
        match future::select(pin!(gone), Timer::after(timeout)).await {
            Either::Left(_) => {
                self.interface = None;
                self.device = None;
                true
            }
            Either::Right(_) => false,
        }
    }
}

async fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .await
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .await
        .ok()
}
