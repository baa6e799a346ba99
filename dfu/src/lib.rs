//! USB Device Firmware Upgrade (DFU) engine based on [`nusb`]
//!
//! Implements the DFU 1.1 state machine and the STM32 extensions
//! (aka "DfuSe") on top of an abstract [`DfuTransport`], so the same
//! protocol code drives real hardware ([`NusbTransport`]) and the simulated
//! device used by the tests ([`MockTransport`]).
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! Download a raw image to the first DFU device found:
//! ```no_run
//! use udfu::{
//!     DfuSession, FirmwareImage, InterfaceSelector, LogObserver,
//!     SessionConfig, find_dfu_devices,
//! };
//!
//! # fn main() -> Result<(), udfu::DfuError> {
//! futures::executor::block_on(async {
//!     let devices = find_dfu_devices(None, None).await?;
//!     let Some(device) = devices.first() else {
//!         println!("No DFU devices found");
//!         return Ok(());
//!     };
//!     let mut session = DfuSession::connect(
//!         device.transport(),
//!         &InterfaceSelector::First,
//!         SessionConfig::default(),
//!     )
//!     .await?;
//!     let image = FirmwareImage::Raw(std::fs::read("firmware.bin").unwrap());
//!     let result = session.perform_update(&image, &LogObserver).await;
//!     session.close().await;
//!     result.map(|_| ())
//! })
//! # }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024;

mod connection;
mod descriptor;
mod device;
mod dfuse;
mod error;
mod events;
mod interface;
mod liveness;
mod memory;
pub mod request;
mod session;
mod status;
pub mod transport;

use std::time::Duration;

// Re-exports
pub use connection::{Completion, DfuConnection};
pub use descriptor::{
    AltSettingDescriptor, ConfigurationDescriptor, DFU_VERSION_NUMBER,
    DFUSE_VERSION_NUMBER, FunctionalDescriptor, RawDescriptor,
    UsbDeviceDescriptor, find_functional_descriptor,
    parse_configuration_descriptor,
};
pub use device::{
    DeviceDescriptor, DeviceProbe, DfuDevice, find_dfu_devices, probe,
    wait_for_device,
};
pub use dfuse::{DfuseConnection, ImageElement, Progress};
pub use error::{DfuError, TransportError};
pub use events::{DfuEvent, DfuObserver, LogObserver, NullObserver, Phase};
pub use interface::{
    AltSettingKey, DfuMode, InterfaceAltSetting, InterfaceSelector,
    backfill_interface_names, dfu_interfaces, read_interface_names,
};
pub use liveness::Liveness;
pub use memory::{
    MemoryMap, MemorySegment, RegionOperation, nice_size, parse_memory_layout,
};
pub use session::{
    DfuSession, DfuTarget, FirmwareImage, SessionConfig, UpdateReport,
};
pub use status::{DeviceStatus, DfuState, DfuStatusCode};
pub use transport::{DfuTransport, MockTransport, NusbTransport};
