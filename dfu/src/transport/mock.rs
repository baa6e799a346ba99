//! Simulated DFU / DfuSe device for tests.
//!
//! The device answers class requests the way a bootloader would, follows
//! the DFU state machine and records every control transfer so tests can
//! assert on the exact request sequence. Faults (stalls, device status
//! errors, disconnects) can be injected.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::DfuTransport;
use crate::descriptor::{
    DESC_TYPE_CONFIGURATION, DESC_TYPE_INTERFACE, DFU_CLASS,
    DFU_PROTOCOL_DFU, DFU_PROTOCOL_RUNTIME, DFU_SUBCLASS,
    DFUSE_VERSION_NUMBER, DFU_VERSION_NUMBER, FunctionalDescriptor,
    UsbDeviceDescriptor,
};
use crate::error::TransportError;
use crate::memory::{MemoryMap, parse_memory_layout};
use crate::request::{
    DFU_ABORT, DFU_CLRSTATUS, DFU_DETACH, DFU_DNLOAD, DFU_GETSTATE,
    DFU_GETSTATUS, DFU_UPLOAD, DFUSE_CMD_ERASE, DFUSE_CMD_SET_ADDRESS,
};
use crate::status::{DeviceStatus, DfuState, DfuStatusCode};

const STRING_MANUFACTURER: u8 = 1;
const STRING_PRODUCT: u8 = 2;
const STRING_SERIAL: u8 = 3;
const STRING_FIRST_INTERFACE: u8 = 4;

/// One alternate setting exposed by the simulated device.
#[derive(Clone, Debug)]
pub struct MockAltSetting {
    pub interface: u8,
    pub alt_setting: u8,
    pub protocol: u8,
    pub name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MockDeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub alt_settings: Vec<MockAltSetting>,
    /// `None` omits the functional descriptor from the configuration
    pub functional: Option<FunctionalDescriptor>,
    pub initial_state: DfuState,
    /// Number of `dfuDNBUSY` answers before a block is accepted
    pub busy_polls: u32,
    pub poll_timeout_ms: u32,
    /// Contents returned by UPLOAD (plain DFU) or preloaded at the start
    /// of the memory map (DfuSe)
    pub firmware: Vec<u8>,
}

impl MockDeviceConfig {
    /// Plain DFU 1.1 device in DFU mode.
    pub fn dfu(transfer_size: u16, manifestation_tolerant: bool) -> Self {
        let mut attributes = FunctionalDescriptor::BIT_CAN_DNLOAD
            | FunctionalDescriptor::BIT_CAN_UPLOAD;
        if manifestation_tolerant {
            attributes |= FunctionalDescriptor::BIT_MANIFESTATION_TOLERANT;
        }
        Self {
            vendor_id: 0x2fe3,
            product_id: 0x0100,
            manufacturer: "Acme".into(),
            product: "Test Board v1.2.3".into(),
            serial_number: "0123456789".into(),
            alt_settings: vec![MockAltSetting {
                interface: 0,
                alt_setting: 0,
                protocol: DFU_PROTOCOL_DFU,
                name: Some("image-0".into()),
            }],
            functional: Some(FunctionalDescriptor::from_parts(
                attributes,
                1000,
                transfer_size,
                DFU_VERSION_NUMBER,
            )),
            initial_state: DfuState::DfuIdle,
            busy_polls: 0,
            poll_timeout_ms: 0,
            firmware: Vec::new(),
        }
    }

    /// STM32 style DfuSe bootloader exposing `layout` on alt setting 0.
    pub fn dfuse(transfer_size: u16, layout: &str) -> Self {
        Self {
            vendor_id: 0x0483,
            product_id: 0xdf11,
            manufacturer: "STMicroelectronics".into(),
            product: "DFU in FS Mode".into(),
            serial_number: "206A36A95141".into(),
            alt_settings: vec![MockAltSetting {
                interface: 0,
                alt_setting: 0,
                protocol: DFU_PROTOCOL_DFU,
                name: Some(layout.into()),
            }],
            functional: Some(FunctionalDescriptor::from_parts(
                FunctionalDescriptor::BIT_CAN_DNLOAD
                    | FunctionalDescriptor::BIT_CAN_UPLOAD
                    | FunctionalDescriptor::BIT_WILL_DETACH,
                255,
                transfer_size,
                DFUSE_VERSION_NUMBER,
            )),
            ..Self::dfu(transfer_size, false)
        }
    }

    /// Application exposing only the DFU runtime interface.
    pub fn runtime(detach_timeout: u16) -> Self {
        let mut config = Self::dfu(1024, true);
        config.alt_settings[0].protocol = DFU_PROTOCOL_RUNTIME;
        config.alt_settings[0].name = None;
        config.functional = Some(FunctionalDescriptor::from_parts(
            FunctionalDescriptor::BIT_CAN_DNLOAD,
            detach_timeout,
            1024,
            DFU_VERSION_NUMBER,
        ));
        config.initial_state = DfuState::AppIdle;
        config
    }

    fn device_descriptor(&self) -> Vec<u8> {
        UsbDeviceDescriptor {
            usb_version: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_version: 0x0200,
            manufacturer_index: STRING_MANUFACTURER,
            product_index: STRING_PRODUCT,
            serial_number_index: STRING_SERIAL,
            num_configurations: 1,
        }
        .to_bytes()
    }

    fn configuration_descriptor(&self) -> Vec<u8> {
        let mut out = vec![9, DESC_TYPE_CONFIGURATION, 0, 0, 1, 1, 0, 0x80, 50];
        let mut interfaces = Vec::new();
        for (i, alt) in self.alt_settings.iter().enumerate() {
            if !interfaces.contains(&alt.interface) {
                interfaces.push(alt.interface);
            }
            let string_index = match alt.name {
                Some(_) => STRING_FIRST_INTERFACE + i as u8,
                None => 0,
            };
            out.extend_from_slice(&[
                9,
                DESC_TYPE_INTERFACE,
                alt.interface,
                alt.alt_setting,
                0,
                DFU_CLASS,
                DFU_SUBCLASS,
                alt.protocol,
                string_index,
            ]);
        }
        if let Some(functional) = &self.functional {
            out.extend_from_slice(&functional.to_bytes());
        }
        let total = (out.len() as u16).to_le_bytes();
        out[2] = total[0];
        out[3] = total[1];
        out[4] = interfaces.len() as u8;
        out
    }

    fn string(&self, index: u8) -> Option<String> {
        match index {
            0 => None,
            STRING_MANUFACTURER => Some(self.manufacturer.clone()),
            STRING_PRODUCT => Some(self.product.clone()),
            STRING_SERIAL => Some(self.serial_number.clone()),
            i => self
                .alt_settings
                .get(usize::from(i - STRING_FIRST_INTERFACE))?
                .name
                .clone(),
        }
    }

    fn is_dfuse(&self) -> bool {
        self.functional.as_ref().is_some_and(|f| f.is_dfuse())
    }

    fn manifestation_tolerant(&self) -> bool {
        self.functional
            .as_ref()
            .is_none_or(|f| f.manifestation_tolerant())
    }
}

/// A control transfer as seen by the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRecord {
    Out {
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    In {
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    },
}

impl ControlRecord {
    pub fn request(&self) -> u8 {
        match self {
            ControlRecord::Out { request, .. }
            | ControlRecord::In { request, .. } => *request,
        }
    }
}

struct MockDevice {
    config: MockDeviceConfig,
    memory_map: Option<MemoryMap>,
    connected: bool,
    claimed_by: Option<u64>,
    next_handle: u64,
    active_configuration: Option<u8>,
    state: DfuState,
    status: DfuStatusCode,
    busy_remaining: u32,
    pending_status: Option<DfuStatusCode>,
    stall_downloads: u32,
    fail_downloads: Vec<DfuStatusCode>,
    requests: Vec<ControlRecord>,
    received: Vec<u8>,
    flash: BTreeMap<u32, u8>,
    erased: Vec<u32>,
    address_pointer: u32,
    block_size: u32,
    upload_offset: usize,
    open_count: usize,
    close_count: usize,
    reset_count: usize,
}

impl MockDevice {
    fn new(config: MockDeviceConfig) -> Self {
        let memory_map = config
            .alt_settings
            .iter()
            .filter_map(|alt| alt.name.as_deref())
            .find_map(parse_memory_layout)
            .filter(|_| config.is_dfuse());
        let mut flash = BTreeMap::new();
        if let Some(map) = &memory_map {
            for (i, b) in config.firmware.iter().enumerate() {
                flash.insert(map.start_address() + i as u32, *b);
            }
        }
        Self {
            state: config.initial_state,
            memory_map,
            connected: true,
            claimed_by: None,
            next_handle: 1,
            active_configuration: Some(1),
            status: DfuStatusCode::Ok,
            busy_remaining: 0,
            pending_status: None,
            stall_downloads: 0,
            fail_downloads: Vec::new(),
            requests: Vec::new(),
            received: Vec::new(),
            flash,
            erased: Vec::new(),
            address_pointer: 0,
            block_size: 0,
            upload_offset: 0,
            open_count: 0,
            close_count: 0,
            reset_count: 0,
            config,
        }
    }

    fn stall(&mut self) -> TransportError {
        self.state = DfuState::DfuError;
        self.status = DfuStatusCode::ErrStalledPkt;
        TransportError::Stalled
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        match request {
            DFU_DETACH => {
                if self.state != DfuState::AppIdle {
                    return Err(self.stall());
                }
                self.state = DfuState::AppDetach;
                Ok(())
            }
            DFU_DNLOAD => self.dnload(value, data),
            DFU_CLRSTATUS => {
                if self.state != DfuState::DfuError {
                    return Err(self.stall());
                }
                self.state = DfuState::DfuIdle;
                self.status = DfuStatusCode::Ok;
                Ok(())
            }
            DFU_ABORT => match self.state {
                DfuState::DfuIdle
                | DfuState::DfuDnloadSync
                | DfuState::DfuDnloadIdle
                | DfuState::DfuUploadIdle => {
                    self.state = DfuState::DfuIdle;
                    self.upload_offset = 0;
                    Ok(())
                }
                _ => Err(self.stall()),
            },
            _ => Err(self.stall()),
        }
    }

    fn dnload(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle)
        {
            return Err(self.stall());
        }
        if data.is_empty() {
            if self.state == DfuState::DfuIdle && !self.config.is_dfuse() {
                return Err(self.stall());
            }
            self.state = DfuState::DfuManifestSync;
            return Ok(());
        }

        let command = self.config.is_dfuse() && block == 0;
        if !command && self.stall_downloads > 0 {
            self.stall_downloads -= 1;
            return Err(self.stall());
        }
        if !command && !self.fail_downloads.is_empty() {
            self.pending_status = Some(self.fail_downloads.remove(0));
        }

        if command {
            self.dfuse_command(data)?;
        } else if self.config.is_dfuse() {
            if block < 2 {
                return Err(self.stall());
            }
            if block == 2 {
                self.block_size = data.len() as u32;
            }
            let addr = self.address_pointer
                + u32::from(block - 2) * self.block_size;
            for (i, b) in data.iter().enumerate() {
                self.flash.insert(addr + i as u32, *b);
            }
        } else {
            self.received.extend_from_slice(data);
        }
        self.state = DfuState::DfuDnloadSync;
        self.busy_remaining = self.config.busy_polls;
        Ok(())
    }

    fn dfuse_command(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let addr = match data.get(1..5) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => return Err(self.stall()),
        };
        match data[0] {
            DFUSE_CMD_SET_ADDRESS => self.address_pointer = addr,
            DFUSE_CMD_ERASE => {
                let page = self
                    .memory_map
                    .as_ref()
                    .and_then(|map| map.segment_at(addr))
                    .filter(|seg| seg.erasable())
                    .map(|seg| seg.page_size());
                match page {
                    Some(size) => {
                        self.erased.push(addr);
                        let end = addr.saturating_add(size);
                        let keys: Vec<u32> = self
                            .flash
                            .range(addr..end)
                            .map(|(k, _)| *k)
                            .collect();
                        for k in keys {
                            self.flash.remove(&k);
                        }
                    }
                    None => {
                        self.pending_status = Some(DfuStatusCode::ErrTarget)
                    }
                }
            }
            _ => return Err(self.stall()),
        }
        Ok(())
    }

    fn get_status(&mut self) -> Vec<u8> {
        match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnbusy => {
                if let Some(status) = self.pending_status.take() {
                    self.state = DfuState::DfuError;
                    self.status = status;
                } else if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    self.state = DfuState::DfuDnbusy;
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
            }
            DfuState::DfuManifestSync => {
                self.state = DfuState::DfuManifest;
            }
            DfuState::DfuManifest => {
                if self.config.manifestation_tolerant() {
                    self.state = DfuState::DfuIdle;
                } else {
                    self.state = DfuState::DfuManifestWaitReset;
                }
            }
            _ => {}
        }
        let response = DeviceStatus {
            status: self.status,
            poll_timeout: self.config.poll_timeout_ms,
            state: self.state,
            string_index: 0,
        }
        .to_bytes()
        .to_vec();

        // a non tolerant device reboots once manifestation started, a DfuSe
        // device jumps to the application
        if self.state == DfuState::DfuManifest
            && (!self.config.manifestation_tolerant() || self.config.is_dfuse())
        {
            self.connected = false;
        }
        response
    }

    fn upload(
        &mut self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle)
        {
            return Err(self.stall());
        }
        if self.config.is_dfuse() {
            let data = match block {
                0 => vec![0x00, DFUSE_CMD_SET_ADDRESS, DFUSE_CMD_ERASE],
                1 => return Err(self.stall()),
                _ => {
                    if block == 2 {
                        self.block_size = u32::from(length);
                    }
                    let addr = self.address_pointer
                        + u32::from(block - 2) * self.block_size;
                    (0..u32::from(length))
                        .map(|i| {
                            self.flash.get(&(addr + i)).copied().unwrap_or(0xff)
                        })
                        .collect()
                }
            };
            self.state = DfuState::DfuUploadIdle;
            return Ok(data);
        }

        let start = self.upload_offset.min(self.config.firmware.len());
        let end = (start + usize::from(length)).min(self.config.firmware.len());
        let data = self.config.firmware[start..end].to_vec();
        if data.len() < usize::from(length) {
            self.state = DfuState::DfuIdle;
            self.upload_offset = 0;
        } else {
            self.state = DfuState::DfuUploadIdle;
            self.upload_offset = end;
        }
        Ok(data)
    }
}

/// Handle on a [`MockDeviceConfig`] simulation.
///
/// Clones talk to the same simulated device but count as separate hosts:
/// only one of them can claim the DFU interface at a time.
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
    handle: u64,
    open: bool,
    claimed: bool,
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        let handle = {
            let mut dev = self.lock();
            dev.next_handle += 1;
            dev.next_handle
        };
        Self {
            device: Arc::clone(&self.device),
            handle,
            open: false,
            claimed: false,
        }
    }
}

impl MockTransport {
    pub fn new(config: MockDeviceConfig) -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice::new(config))),
            handle: 1,
            open: false,
            claimed: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_ready(&self) -> Result<(), TransportError> {
        if !self.lock().connected {
            Err(TransportError::Disconnected)
        } else if !self.open || !self.claimed {
            Err(TransportError::NotOpen)
        } else {
            Ok(())
        }
    }

    /// Every control transfer received so far.
    pub fn requests(&self) -> Vec<ControlRecord> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// `(block, payload)` of every DNLOAD received so far.
    pub fn downloads(&self) -> Vec<(u16, Vec<u8>)> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                ControlRecord::Out {
                    request: DFU_DNLOAD,
                    value,
                    data,
                    ..
                } => Some((*value, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Firmware accumulated by a plain DFU download.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Page addresses erased by DfuSe ERASE commands, in order.
    pub fn erased_pages(&self) -> Vec<u32> {
        self.lock().erased.clone()
    }

    /// DfuSe memory contents, erased bytes read as `0xff`.
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let dev = self.lock();
        (0..len as u32)
            .map(|i| dev.flash.get(&(address + i)).copied().unwrap_or(0xff))
            .collect()
    }

    pub fn address_pointer(&self) -> u32 {
        self.lock().address_pointer
    }

    pub fn state(&self) -> DfuState {
        self.lock().state
    }

    pub fn set_state(&self, state: DfuState, status: DfuStatusCode) {
        let mut dev = self.lock();
        dev.state = state;
        dev.status = status;
    }

    /// Stall the next `count` data DNLOAD requests.
    pub fn stall_next_downloads(&self, count: u32) {
        self.lock().stall_downloads = count;
    }

    /// Accept the next data DNLOAD but report `status` on the following
    /// GETSTATUS.
    pub fn fail_next_download(&self, status: DfuStatusCode) {
        self.lock().fail_downloads.push(status);
    }

    /// Unplug the device.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().claimed_by.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn reset_count(&self) -> usize {
        self.lock().reset_count
    }
}

impl DfuTransport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut dev = self.lock();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        dev.open_count += 1;
        drop(dev);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        let handle = self.handle;
        let mut dev = self.lock();
        if dev.claimed_by == Some(handle) {
            dev.claimed_by = None;
        }
        if self.open {
            dev.close_count += 1;
        }
        drop(dev);
        self.open = false;
        self.claimed = false;
    }

    async fn device_descriptor(&mut self) -> Result<Vec<u8>, TransportError> {
        let dev = self.lock();
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        Ok(dev.config.device_descriptor())
    }

    async fn configuration_descriptor(
        &mut self,
        index: u8,
    ) -> Result<Vec<u8>, TransportError> {
        let dev = self.lock();
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if index != 0 {
            return Err(TransportError::Stalled);
        }
        Ok(dev.config.configuration_descriptor())
    }

    async fn string_descriptor(&mut self, index: u8) -> Option<String> {
        if !self.open {
            return None;
        }
        self.lock().config.string(index)
    }

    fn active_configuration(&self) -> Option<u8> {
        self.lock().active_configuration
    }

    async fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if configuration != 1 {
            return Err(TransportError::Stalled);
        }
        self.lock().active_configuration = Some(configuration);
        Ok(())
    }

    async fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let handle = self.handle;
        let mut dev = self.lock();
        if !dev.config.alt_settings.iter().any(|a| {
            a.interface == interface && a.alt_setting == alt_setting
        }) {
            return Err(TransportError::Other(format!(
                "no alternate setting {interface}/{alt_setting}"
            )));
        }
        match dev.claimed_by {
            Some(owner) if owner != handle => return Err(TransportError::Busy),
            _ => dev.claimed_by = Some(handle),
        }
        drop(dev);
        self.claimed = true;
        Ok(())
    }

    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.check_ready()?;
        let mut dev = self.lock();
        dev.requests.push(ControlRecord::Out {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        dev.control_out(request, value, data)
    }

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_ready()?;
        let mut dev = self.lock();
        dev.requests.push(ControlRecord::In {
            request,
            value,
            index,
            length,
        });
        let mut data = match request {
            DFU_GETSTATUS => dev.get_status(),
            DFU_GETSTATE => vec![dev.state.as_u8()],
            DFU_UPLOAD => dev.upload(value, length)?,
            _ => return Err(dev.stall()),
        };
        data.truncate(usize::from(length));
        Ok(data)
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.check_ready()?;
        let mut dev = self.lock();
        dev.reset_count += 1;
        if dev.state == DfuState::AppDetach {
            dev.state = DfuState::DfuIdle;
            for alt in &mut dev.config.alt_settings {
                alt.protocol = DFU_PROTOCOL_DFU;
            }
        }
        Ok(())
    }

    async fn wait_disconnected(&mut self, _timeout: Duration) -> bool {
        !self.lock().connected
    }
}
