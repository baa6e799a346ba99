//! Transport layer abstraction.
//!
//! [`DfuTransport`] is the only seam touching raw USB I/O. It has no DFU
//! knowledge: requests are forwarded as class/interface control transfers
//! on the claimed interface.

use std::time::Duration;

use crate::error::TransportError;

pub mod mock;
pub mod nusb;

pub use mock::{ControlRecord, MockAltSetting, MockDeviceConfig, MockTransport};
pub use self::nusb::NusbTransport;

/// Abstract USB access used by a DFU session.
///
/// Implementations:
/// - [`NusbTransport`] on top of a real device
/// - [`MockTransport`], a simulated DFU/DfuSe device for tests
///
/// A transfer that returns an error must be treated as not applied.
#[allow(async_fn_in_trait)]
pub trait DfuTransport {
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the interface and the device handle. Never fails.
    async fn close(&mut self);

    /// Raw 18-byte device descriptor.
    async fn device_descriptor(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Raw configuration descriptor set (`wTotalLength` bytes).
    async fn configuration_descriptor(
        &mut self,
        index: u8,
    ) -> Result<Vec<u8>, TransportError>;

    /// String descriptor in the device's first language, `None` if the
    /// index is zero or the device refuses it.
    async fn string_descriptor(&mut self, index: u8) -> Option<String>;

    /// Currently active `bConfigurationValue`.
    fn active_configuration(&self) -> Option<u8>;

    async fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError>;

    async fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError>;

    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// USB port reset. The device usually re-enumerates afterwards.
    async fn reset(&mut self) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the device to leave the bus.
    /// Returns `true` if it did.
    async fn wait_disconnected(&mut self, timeout: Duration) -> bool;
}
