//! Session orchestrator: connect, update, tear down.

use std::time::Duration;

use async_io::Timer;
use log::{debug, info, warn};

use crate::connection::{Completion, DfuConnection};
use crate::descriptor::{FunctionalDescriptor, find_functional_descriptor};
use crate::device::{DeviceDescriptor, probe};
use crate::dfuse::{DfuseConnection, ImageElement, Progress};
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver, Phase};
use crate::interface::{DfuMode, InterfaceAltSetting, InterfaceSelector};
use crate::liveness::Liveness;
use crate::memory::MemoryMap;
use crate::status::{DeviceStatus, DfuState};
use crate::transport::DfuTransport;

/// Transfer size used on devices that are known to misbehave with larger
/// blocks.
const QUIRK_TRANSFER_SIZE: u16 = 512;

/// Tunables of a [`DfuSession`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Download attempts, including the first one
    pub max_retries: u32,
    /// Pause before the first download attempt
    pub settle_delay: Duration,
    /// Pause between a failed attempt and the next one
    pub retry_backoff: Duration,
    /// Longest time without a state change while polling
    pub max_poll_wait: Duration,
    /// How long to wait for a non manifestation tolerant device to leave
    pub disconnect_timeout: Duration,
    /// Overrides `wTransferSize`
    pub transfer_size: Option<u16>,
    /// Issue a USB reset once the device is back in `dfuIDLE`
    pub reset_after_update: bool,
    /// DfuSe start address for raw images, defaults to the memory map start
    pub dfuse_address: Option<u32>,
    pub detach_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            settle_delay: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(1000),
            max_poll_wait: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            transfer_size: None,
            reset_after_update: false,
            dfuse_address: None,
            detach_timeout: Duration::from_millis(1000),
        }
    }
}

/// Firmware to download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirmwareImage {
    /// Raw binary. DfuSe devices place it at the configured address.
    Raw(Vec<u8>),
    /// Addressed elements of a DfuSe file
    Elements(Vec<ImageElement>),
}

impl FirmwareImage {
    pub fn len(&self) -> usize {
        match self {
            FirmwareImage::Raw(data) => data.len(),
            FirmwareImage::Elements(elements) => {
                elements.iter().map(|e| e.data.len()).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateReport {
    pub attempts: u32,
    pub completion: Completion,
    pub bytes: usize,
}

/// Plain DFU or DfuSe state machine, chosen at connect time.
pub enum DfuTarget<T: DfuTransport> {
    Standard(DfuConnection<T>),
    Dfuse(DfuseConnection<T>),
}

impl<T: DfuTransport> DfuTarget<T> {
    pub fn connection(&self) -> &DfuConnection<T> {
        match self {
            DfuTarget::Standard(conn) => conn,
            DfuTarget::Dfuse(conn) => conn.connection(),
        }
    }

    pub fn connection_mut(&mut self) -> &mut DfuConnection<T> {
        match self {
            DfuTarget::Standard(conn) => conn,
            DfuTarget::Dfuse(conn) => conn.connection_mut(),
        }
    }

    fn into_transport(self) -> T {
        match self {
            DfuTarget::Standard(conn) => conn.into_transport(),
            DfuTarget::Dfuse(conn) => conn.into_inner().into_transport(),
        }
    }
}

struct Setup {
    descriptor: DeviceDescriptor,
    interface: InterfaceAltSetting,
    functional: FunctionalDescriptor,
    transfer_size: u16,
    quirk: Option<String>,
}

/// An exclusively owned connection to one DFU interface of a device.
pub struct DfuSession<T: DfuTransport> {
    target: DfuTarget<T>,
    descriptor: DeviceDescriptor,
    interface: InterfaceAltSetting,
    functional: FunctionalDescriptor,
    config: SessionConfig,
    liveness: Liveness,
    quirk: Option<String>,
}

impl<T: DfuTransport> DfuSession<T> {
    /// Open `transport`, pick the interface and build the state machine
    /// matching the device. The transport is closed again on failure.
    pub async fn connect(
        mut transport: T,
        selector: &InterfaceSelector,
        config: SessionConfig,
    ) -> Result<Self, DfuError> {
        transport.open().await?;
        let setup = match Self::setup(&mut transport, selector, &config).await {
            Ok(setup) => setup,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let liveness = Liveness::new();
        let mut conn = DfuConnection::new(
            transport,
            setup.interface.interface,
            setup.transfer_size,
            DfuState::DfuIdle,
            config.max_poll_wait,
            liveness.clone(),
        );
        match conn.get_status().await {
            Ok(st) => info!("initial state {}, {}", st.state, st.status),
            Err(e) if setup.interface.mode() == DfuMode::Runtime => {
                debug!("runtime interface without GETSTATUS: {e}");
                conn = DfuConnection::new(
                    conn.into_transport(),
                    setup.interface.interface,
                    setup.transfer_size,
                    DfuState::AppIdle,
                    config.max_poll_wait,
                    liveness.clone(),
                );
            }
            Err(e) => {
                conn.into_transport().close().await;
                return Err(e);
            }
        }

        let target = if setup.functional.is_dfuse()
            && setup.interface.mode() == DfuMode::Dfu
        {
            match setup.interface.memory_map() {
                Some(memory) => {
                    info!("DfuSe interface, {}", memory.name);
                    DfuTarget::Dfuse(DfuseConnection::new(conn, memory))
                }
                None => {
                    conn.into_transport().close().await;
                    return Err(DfuError::NoMemorySegments);
                }
            }
        } else {
            DfuTarget::Standard(conn)
        };

        Ok(DfuSession {
            target,
            descriptor: setup.descriptor,
            interface: setup.interface,
            functional: setup.functional,
            config,
            liveness,
            quirk: setup.quirk,
        })
    }

    async fn setup(
        transport: &mut T,
        selector: &InterfaceSelector,
        config: &SessionConfig,
    ) -> Result<Setup, DfuError> {
        let probed = probe(transport).await?;
        let interface = selector
            .select(&probed.descriptor.interfaces)
            .cloned()
            .ok_or(DfuError::NoDfuInterface)?;
        debug!("selected {interface}");

        transport.select_configuration(interface.configuration).await?;
        transport
            .claim_interface(interface.interface, interface.alt_setting)
            .await?;

        let functional = find_functional_descriptor(
            &probed.configurations,
            interface.configuration,
        )
        .unwrap_or_else(|| {
            warn!("no DFU functional descriptor, using defaults");
            FunctionalDescriptor::fallback()
        });

        let mut transfer_size = config
            .transfer_size
            .unwrap_or(functional.transfer_size());
        if transfer_size == 0 {
            transfer_size = crate::DEFAULT_TRANSFER_SIZE;
        }
        let mut quirk = None;
        if needs_small_transfers(&probed.descriptor)
            && transfer_size > QUIRK_TRANSFER_SIZE
        {
            transfer_size = QUIRK_TRANSFER_SIZE;
            quirk = Some(format!(
                "Using optimized transfer size: {transfer_size} bytes"
            ));
        }

        Ok(Setup {
            descriptor: probed.descriptor,
            interface,
            functional,
            transfer_size,
            quirk,
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn interface(&self) -> &InterfaceAltSetting {
        &self.interface
    }

    pub fn functional_descriptor(&self) -> &FunctionalDescriptor {
        &self.functional
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn target(&self) -> &DfuTarget<T> {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut DfuTarget<T> {
        &mut self.target
    }

    pub fn transfer_size(&self) -> u16 {
        self.target.connection().transfer_size()
    }

    pub fn state(&self) -> DfuState {
        self.target.connection().state()
    }

    pub fn memory_map(&self) -> Option<&MemoryMap> {
        match &self.target {
            DfuTarget::Dfuse(conn) => Some(conn.memory_map()),
            DfuTarget::Standard(_) => None,
        }
    }

    pub fn is_dfuse(&self) -> bool {
        matches!(self.target, DfuTarget::Dfuse(_))
    }

    /// Handle for cancelling the session or flagging a disconnect from
    /// another thread.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn summary(&self) -> String {
        self.descriptor.summary(&self.interface)
    }

    pub fn transport(&self) -> &T {
        self.target.connection().transport()
    }

    pub async fn get_status(&mut self) -> Result<DeviceStatus, DfuError> {
        self.target.connection_mut().get_status().await
    }

    pub async fn get_state(&mut self) -> Result<DfuState, DfuError> {
        self.target.connection_mut().get_state().await
    }

    pub async fn clear_status(&mut self) -> Result<(), DfuError> {
        self.target.connection_mut().clear_status().await
    }

    pub async fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        self.target.connection_mut().abort_to_idle().await
    }

    /// Switch a runtime mode device to DFU mode. The session is no longer
    /// usable afterwards; the device re-enumerates.
    pub async fn detach(&mut self) -> Result<(), DfuError> {
        let conn = self.target.connection_mut();
        conn.detach(self.config.detach_timeout).await?;
        if !self.functional.will_detach() {
            debug!("device will not detach by itself, resetting");
            conn.transport_mut().reset().await?;
        }
        self.liveness.mark_disconnected();
        Ok(())
    }

    /// Read up to `max_size` bytes from the device. DfuSe devices read
    /// from the configured address or the start of the memory map.
    pub async fn upload(
        &mut self,
        max_size: usize,
        observer: &impl DfuObserver,
    ) -> Result<Vec<u8>, DfuError> {
        if !self.functional.can_upload() {
            return Err(DfuError::ProtocolViolation(
                "device does not support upload".into(),
            ));
        }
        self.target.connection_mut().reset_state().await?;
        let progress = |done, total| {
            observer.on_event(&DfuEvent::Progress {
                phase: Phase::Upload,
                done,
                total,
            })
        };
        let data = match &mut self.target {
            DfuTarget::Standard(conn) => {
                conn.upload_blocks(0, max_size, |done| progress(done, max_size))
                    .await?
            }
            DfuTarget::Dfuse(conn) => {
                let address = self
                    .config
                    .dfuse_address
                    .unwrap_or(conn.memory_map().start_address());
                conn.upload_range(address, max_size, |p| {
                    if let Progress::Read { done, total } = p {
                        progress(done, total)
                    }
                })
                .await?
            }
        };
        observer.on_event(&DfuEvent::Info(format!(
            "Read {} bytes",
            data.len()
        )));
        Ok(data)
    }

    /// Download `image` with bounded retries.
    ///
    /// Runs error recovery, the settle delay, the download itself and
    /// completion detection. Only recoverable failures (stalls) are retried;
    /// anything else is reported to `observer` and returned as is.
    pub async fn perform_update(
        &mut self,
        image: &FirmwareImage,
        observer: &impl DfuObserver,
    ) -> Result<UpdateReport, DfuError> {
        if !self.functional.can_download() {
            return Err(DfuError::ProtocolViolation(
                "device does not support download".into(),
            ));
        }
        if let Err(e) = self.target.connection_mut().reset_state().await {
            if e.is_disconnected() {
                return Err(self.fail(e, observer));
            }
            observer.on_event(&DfuEvent::Warning(format!(
                "Failed to clear status: {e}"
            )));
        }

        observer.on_event(&DfuEvent::Info(
            "Preparing for firmware update...".into(),
        ));
        sleep(self.config.settle_delay).await;
        if let Some(quirk) = &self.quirk {
            observer.on_event(&DfuEvent::Info(quirk.clone()));
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;
        let completion = loop {
            if attempts > 0 {
                observer.on_event(&DfuEvent::Retry {
                    attempt: attempts,
                    max_attempts,
                });
                match self.target.connection_mut().reset_state().await {
                    Ok(()) => observer.on_event(&DfuEvent::Info(
                        "Device reset successful".into(),
                    )),
                    Err(e) => observer.on_event(&DfuEvent::Warning(format!(
                        "Device reset failed: {e}"
                    ))),
                }
                sleep(self.config.retry_backoff).await;
            }

            match self.download_once(image, observer).await {
                Ok(completion) => break completion,
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts || !e.is_recoverable() {
                        return Err(self.fail(e, observer));
                    }
                    observer.on_event(&DfuEvent::Warning(format!(
                        "Update failed: {e}"
                    )));
                    observer.on_event(&DfuEvent::Info(
                        "Will retry in a moment...".into(),
                    ));
                }
            }
        };
        observer.on_event(&DfuEvent::Info("Update complete!".into()));
        self.complete(completion, observer).await?;

        Ok(UpdateReport {
            attempts: attempts + 1,
            completion,
            bytes: image.len(),
        })
    }

    async fn download_once(
        &mut self,
        image: &FirmwareImage,
        observer: &impl DfuObserver,
    ) -> Result<Completion, DfuError> {
        let tolerant = self.functional.manifestation_tolerant();
        let total = image.len();
        let dfuse_progress = |p: Progress| {
            let (phase, done, total) = match p {
                Progress::Erase { page, pages, .. } => {
                    (Phase::Erase, page, pages)
                }
                Progress::Write { done, total } => {
                    (Phase::Download, done, total)
                }
                Progress::Read { done, total } => (Phase::Upload, done, total),
            };
            observer.on_event(&DfuEvent::Progress { phase, done, total });
        };

        match (&mut self.target, image) {
            (DfuTarget::Standard(conn), FirmwareImage::Raw(data)) => {
                conn.download(data, tolerant, |done| {
                    observer.on_event(&DfuEvent::Progress {
                        phase: Phase::Download,
                        done,
                        total,
                    })
                })
                .await
            }
            (DfuTarget::Standard(_), FirmwareImage::Elements(_)) => {
                Err(DfuError::UnsupportedImage(
                    "addressed image on a plain DFU interface".into(),
                ))
            }
            (DfuTarget::Dfuse(conn), FirmwareImage::Raw(data)) => {
                let address = self
                    .config
                    .dfuse_address
                    .unwrap_or(conn.memory_map().start_address());
                conn.download_image(address, data, dfuse_progress).await
            }
            (DfuTarget::Dfuse(conn), FirmwareImage::Elements(elements)) => {
                conn.download_elements(elements, dfuse_progress).await
            }
        }
    }

    async fn complete(
        &mut self,
        completion: Completion,
        observer: &impl DfuObserver,
    ) -> Result<(), DfuError> {
        match completion {
            Completion::AwaitingDisconnect => {
                let timeout = self.config.disconnect_timeout;
                let transport = self.target.connection_mut().transport_mut();
                if transport.wait_disconnected(timeout).await {
                    self.liveness.mark_disconnected();
                    observer.on_event(&DfuEvent::Info(
                        "Device disconnected after update".into(),
                    ));
                } else {
                    observer.on_event(&DfuEvent::Warning(
                        "Device remained connected after update".into(),
                    ));
                }
            }
            Completion::Idle if self.config.reset_after_update => {
                observer.on_event(&DfuEvent::Info("Resetting device".into()));
                self.target.connection_mut().transport_mut().reset().await?;
                self.liveness.mark_disconnected();
            }
            Completion::Idle => {}
        }
        Ok(())
    }

    fn fail(&self, e: DfuError, observer: &impl DfuObserver) -> DfuError {
        observer.on_event(&DfuEvent::Error(format!("Update failed: {e}")));
        for hint in e.recovery_hints().unwrap_or_default() {
            observer.on_event(&DfuEvent::Info((*hint).to_string()));
        }
        e
    }

    /// Release the interface and the device, whatever state the session
    /// is in.
    pub async fn close(self) {
        let mut transport = self.target.into_transport();
        transport.close().await;
    }
}

fn needs_small_transfers(descriptor: &DeviceDescriptor) -> bool {
    descriptor
        .product
        .as_deref()
        .is_some_and(|p| p.contains("MCUBOOT"))
        || descriptor
            .manufacturer
            .as_deref()
            .is_some_and(|m| m.contains("ZEPHYR"))
}

async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        Timer::after(duration).await;
    }
}
