use std::time::{Duration, Instant};

use async_io::Timer;
use log::{debug, trace, warn};

use crate::error::{DfuError, TransportError};
use crate::liveness::Liveness;
use crate::request::*;
use crate::status::{DFU_STATUS_LEN, DeviceStatus, DfuState};
use crate::transport::DfuTransport;

/// How a download ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Manifestation finished and the device is back in `dfuIDLE`.
    Idle,
    /// Manifestation started on a device that is not manifestation tolerant;
    /// it is expected to leave the bus.
    AwaitingDisconnect,
}

/// Standard DFU 1.1 state machine over a claimed interface.
///
/// Every request goes through `&mut self`, so at most one control transfer
/// is in flight per session. The last state reported by the device is
/// cached and used to reject requests the state machine does not allow
/// before anything is sent.
pub struct DfuConnection<T: DfuTransport> {
    transport: T,
    interface: u16,
    xfer_size: u16,
    state: DfuState,
    max_poll_wait: Duration,
    liveness: Liveness,
}

impl<T: DfuTransport> DfuConnection<T> {
    pub fn new(
        transport: T,
        interface: u8,
        xfer_size: u16,
        state: DfuState,
        max_poll_wait: Duration,
        liveness: Liveness,
    ) -> Self {
        DfuConnection {
            transport,
            interface: u16::from(interface),
            xfer_size: if xfer_size > 0 {
                xfer_size
            } else {
                crate::DEFAULT_TRANSFER_SIZE
            },
            state,
            max_poll_wait,
            liveness,
        }
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    /// Last state reported by the device.
    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub async fn get_status(&mut self) -> Result<DeviceStatus, DfuError> {
        let data = self.cmd_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN).await?;
        let st = DeviceStatus::from_raw(&data)?;
        debug!(
            "status: {}, state={}, poll={}ms",
            st.status, st.state, st.poll_timeout
        );
        self.state = st.state;
        Ok(st)
    }

    pub async fn get_state(&mut self) -> Result<DfuState, DfuError> {
        let data = self.cmd_in(DFU_GETSTATE, 0, 1).await?;
        let raw = *data.first().ok_or_else(|| {
            DfuError::ProtocolViolation("empty GETSTATE response".into())
        })?;
        let state = DfuState::from_u8(raw).ok_or_else(|| {
            DfuError::ProtocolViolation(format!("unknown DFU state {raw}"))
        })?;
        self.state = state;
        Ok(state)
    }

    /// Leave `dfuERROR`. Rejected without any transfer in every other state.
    pub async fn clear_status(&mut self) -> Result<(), DfuError> {
        if self.state != DfuState::DfuError {
            return Err(DfuError::unexpected_state("CLRSTATUS", self.state));
        }
        self.cmd_out(DFU_CLRSTATUS, 0, &[]).await?;
        let st = self.get_status().await?;
        st.ok()?;
        if st.state != DfuState::DfuIdle {
            return Err(DfuError::ProtocolViolation(format!(
                "CLRSTATUS left the device in {}",
                st.state
            )));
        }
        Ok(())
    }

    /// Return to `dfuIDLE` from any non-manifesting DFU mode state.
    pub async fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        if self.state.is_manifesting() || self.state.is_runtime() {
            return Err(DfuError::unexpected_state("ABORT", self.state));
        }
        if self.state == DfuState::DfuError {
            // ABORT is not accepted in dfuERROR
            return self.clear_status().await;
        }
        self.cmd_out(DFU_ABORT, 0, &[]).await?;
        let st = self.get_status().await?;
        st.ok()?;
        if st.state != DfuState::DfuIdle {
            return Err(DfuError::ProtocolViolation(format!(
                "ABORT left the device in {}",
                st.state
            )));
        }
        Ok(())
    }

    /// Bring the device back to `dfuIDLE` from whatever it reports.
    pub async fn reset_state(&mut self) -> Result<(), DfuError> {
        let st = self.get_status().await?;
        if st.state == DfuState::DfuError {
            debug!("clearing error status: {}", st.status);
            self.clear_status().await?;
        }
        if self.state != DfuState::DfuIdle {
            self.abort_to_idle().await?;
        }
        Ok(())
    }

    /// Ask a runtime mode device to switch to DFU mode.
    pub async fn detach(&mut self, timeout: Duration) -> Result<(), DfuError> {
        if self.state != DfuState::AppIdle {
            return Err(DfuError::unexpected_state("DETACH", self.state));
        }
        let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        self.cmd_out(DFU_DETACH, timeout_ms, &[]).await?;
        self.state = DfuState::AppDetach;
        Ok(())
    }

    /// Issue a single DNLOAD request without waiting for the device.
    pub async fn dnload(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle) {
            return Err(DfuError::unexpected_state("DNLOAD", self.state));
        }
        self.cmd_out(DFU_DNLOAD, block, data).await?;
        self.state = DfuState::DfuDnloadSync;
        Ok(())
    }

    /// DNLOAD one block and wait until the device has processed it.
    pub async fn dnload_block(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<DeviceStatus, DfuError> {
        self.dnload(block, data).await?;
        let st = self.poll_while_busy().await?;
        if st.state != DfuState::DfuDnloadIdle {
            return Err(DfuError::ProtocolViolation(format!(
                "expected {} after block {block}, got {}",
                DfuState::DfuDnloadIdle,
                st.state
            )));
        }
        Ok(st)
    }

    pub async fn poll_while_busy(&mut self) -> Result<DeviceStatus, DfuError> {
        self.poll_while(|state| {
            matches!(state, DfuState::DfuDnloadSync | DfuState::DfuDnbusy)
        })
        .await
    }

    /// Poll GETSTATUS, honouring the requested poll timeout, until the state
    /// no longer satisfies `busy`.
    async fn poll_while(
        &mut self,
        busy: impl Fn(DfuState) -> bool,
    ) -> Result<DeviceStatus, DfuError> {
        let mut last_progress = Instant::now();
        let mut last_state = self.state;
        loop {
            let st = self.get_status().await?;
            st.ok()?;
            let delay = st.poll_delay();
            if !delay.is_zero() {
                Timer::after(delay).await;
            }
            if !busy(st.state) {
                return Ok(st);
            }
            if st.state != last_state {
                last_state = st.state;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > self.max_poll_wait {
                return Err(DfuError::Timeout(self.max_poll_wait));
            }
        }
    }

    /// Download a complete image.
    ///
    /// The image is sent in blocks of the transfer size, followed by a
    /// zero-length DNLOAD starting manifestation. `progress` receives the
    /// cumulative number of bytes after each block.
    pub async fn download(
        &mut self,
        image: &[u8],
        manifestation_tolerant: bool,
        mut progress: impl FnMut(usize),
    ) -> Result<Completion, DfuError> {
        if image.is_empty() {
            return Err(DfuError::UnsupportedImage("empty image".into()));
        }
        let mut sent = 0;
        let mut block: u16 = 0;
        for chunk in image.chunks(usize::from(self.xfer_size)) {
            self.check_cancelled().await?;
            trace!("block {block}: {} bytes", chunk.len());
            self.dnload_block(block, chunk).await?;
            sent += chunk.len();
            progress(sent);
            block = block.wrapping_add(1);
        }
        self.finish_download(block, manifestation_tolerant).await
    }

    /// Send the zero-length DNLOAD and follow manifestation.
    pub async fn finish_download(
        &mut self,
        block: u16,
        manifestation_tolerant: bool,
    ) -> Result<Completion, DfuError> {
        self.dnload(block, &[]).await?;
        self.state = DfuState::DfuManifestSync;
        self.manifest(manifestation_tolerant).await
    }

    async fn manifest(
        &mut self,
        manifestation_tolerant: bool,
    ) -> Result<Completion, DfuError> {
        if !manifestation_tolerant {
            return match self.get_status().await {
                Ok(st) => {
                    st.ok()?;
                    match st.state {
                        DfuState::DfuIdle => Ok(Completion::Idle),
                        s if s.is_manifesting() => {
                            Ok(Completion::AwaitingDisconnect)
                        }
                        s => {
                            Err(DfuError::unexpected_state("manifestation", s))
                        }
                    }
                }
                // device already went away to apply the image
                Err(DfuError::Transport(
                    TransportError::Disconnected | TransportError::Stalled,
                )) => {
                    self.state = DfuState::DfuManifestWaitReset;
                    Ok(Completion::AwaitingDisconnect)
                }
                Err(e) => Err(e),
            };
        }

        let st = self
            .poll_while(|state| {
                matches!(
                    state,
                    DfuState::DfuManifestSync | DfuState::DfuManifest
                )
            })
            .await?;
        match st.state {
            DfuState::DfuIdle => Ok(Completion::Idle),
            DfuState::DfuManifestWaitReset => {
                warn!("device waits for a reset despite being tolerant");
                Ok(Completion::AwaitingDisconnect)
            }
            s => Err(DfuError::unexpected_state("manifestation", s)),
        }
    }

    /// Read up to `max_size` bytes with UPLOAD, block numbers counting up
    /// from `first_block`. A short read ends the transfer.
    pub async fn upload_blocks(
        &mut self,
        first_block: u16,
        max_size: usize,
        mut progress: impl FnMut(usize),
    ) -> Result<Vec<u8>, DfuError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            return Err(DfuError::unexpected_state("UPLOAD", self.state));
        }
        let mut data = Vec::new();
        let mut block = first_block;
        while data.len() < max_size {
            self.check_cancelled().await?;
            let len = (max_size - data.len()).min(usize::from(self.xfer_size));
            let chunk = self.cmd_in(DFU_UPLOAD, block, len as u16).await?;
            self.state = DfuState::DfuUploadIdle;
            let short = chunk.len() < len;
            data.extend_from_slice(&chunk);
            progress(data.len());
            if short {
                // the device returns to dfuIDLE by itself
                self.state = DfuState::DfuIdle;
                break;
            }
            block = block.wrapping_add(1);
        }
        if self.state == DfuState::DfuUploadIdle {
            self.abort_to_idle().await?;
        }
        Ok(data)
    }

    pub async fn upload(
        &mut self,
        max_size: usize,
    ) -> Result<Vec<u8>, DfuError> {
        self.upload_blocks(0, max_size, |_| {}).await
    }

    /// Abort at a block boundary if cancellation was requested, leaving the
    /// device idle.
    pub(crate) async fn check_cancelled(&mut self) -> Result<(), DfuError> {
        if !self.liveness.is_cancelled() {
            return Ok(());
        }
        warn!("cancelled in state {}", self.state);
        if let Err(e) = self.abort_to_idle().await {
            warn!("abort after cancellation failed: {e}");
        }
        Err(DfuError::Cancelled)
    }

    pub(crate) async fn cmd_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        self.liveness.ensure_connected()?;
        let result = self
            .transport
            .control_out(request, value, self.interface, data)
            .await;
        self.transfer_result(result)
    }

    pub(crate) async fn cmd_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.liveness.ensure_connected()?;
        let result = self
            .transport
            .control_in(request, value, self.interface, length)
            .await;
        self.transfer_result(result)
    }

    fn transfer_result<R>(
        &mut self,
        result: Result<R, TransportError>,
    ) -> Result<R, DfuError> {
        result.map_err(|e| {
            match e {
                TransportError::Disconnected => {
                    self.liveness.mark_disconnected()
                }
                // a stalled request puts the device in dfuERROR
                TransportError::Stalled => self.state = DfuState::DfuError,
                _ => {}
            }
            DfuError::Transport(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::status::DfuStatusCode;
    use crate::transport::{MockDeviceConfig, MockTransport};

    fn connect(
        mock: &MockTransport,
        state: DfuState,
    ) -> DfuConnection<MockTransport> {
        let mut transport = mock.clone();
        block_on(async {
            transport.open().await.unwrap();
            transport.claim_interface(0, 0).await.unwrap();
        });
        DfuConnection::new(
            transport,
            0,
            1024,
            state,
            Duration::from_secs(1),
            Liveness::new(),
        )
    }

    #[test]
    fn test_clear_status_only_from_error() {
        for state in DfuState::ALL {
            if state == DfuState::DfuError {
                continue;
            }
            let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
            mock.set_state(state, DfuStatusCode::Ok);
            let mut conn = connect(&mock, state);
            let err = block_on(conn.clear_status());
            assert!(
                matches!(err, Err(DfuError::ProtocolViolation(_))),
                "{state}: {err:?}"
            );
            assert!(mock.requests().is_empty(), "{state}");
        }

        let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
        mock.set_state(DfuState::DfuError, DfuStatusCode::ErrWrite);
        let mut conn = connect(&mock, DfuState::DfuError);
        block_on(conn.clear_status()).unwrap();
        assert_eq!(conn.state(), DfuState::DfuIdle);
    }

    #[test]
    fn test_abort_rejected_while_manifesting() {
        let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
        let mut conn = connect(&mock, DfuState::DfuManifest);
        assert!(matches!(
            block_on(conn.abort_to_idle()),
            Err(DfuError::ProtocolViolation(_))
        ));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_busy_polls() {
        let mut config = MockDeviceConfig::dfu(4, true);
        config.busy_polls = 3;
        let mock = MockTransport::new(config);
        let mut conn = connect(&mock, DfuState::DfuIdle);
        let st = block_on(conn.dnload_block(0, &[1, 2, 3, 4])).unwrap();
        assert_eq!(st.state, DfuState::DfuDnloadIdle);
        let polls = mock
            .requests()
            .iter()
            .filter(|r| r.request() == DFU_GETSTATUS)
            .count();
        assert_eq!(polls, 4);
    }

    #[test]
    fn test_device_error_during_download() {
        let mock = MockTransport::new(MockDeviceConfig::dfu(4, true));
        mock.fail_next_download(DfuStatusCode::ErrWrite);
        let mut conn = connect(&mock, DfuState::DfuIdle);
        let err = block_on(conn.download(&[0; 10], true, |_| {})).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Device {
                status: DfuStatusCode::ErrWrite,
                state: DfuState::DfuError
            }
        ));
        assert!(!err.is_recoverable());
        assert_eq!(mock.downloads().len(), 1);
    }

    #[test]
    fn test_get_state() {
        let mock = MockTransport::new(MockDeviceConfig::dfu(4, true));
        let mut conn = connect(&mock, DfuState::DfuIdle);
        assert_eq!(block_on(conn.get_state()).unwrap(), DfuState::DfuIdle);
    }
}
