mod common;

use std::time::{Duration, Instant};

use futures::executor::block_on;
use udfu::request::{DFU_ABORT, DFU_DNLOAD, DFU_GETSTATUS};
use udfu::transport::{MockDeviceConfig, MockTransport};
use udfu::{
    Completion, DfuError, DfuSession, DfuState, DfuStatusCode, FirmwareImage,
    InterfaceSelector, Phase, SessionConfig, TransportError,
};

use common::*;

fn data_downloads(mock: &MockTransport) -> usize {
    mock.downloads()
        .iter()
        .filter(|(_, data)| !data.is_empty())
        .count()
}

#[test]
fn download_2050_bytes_tolerant() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    let image = pattern(2050);
    let observer = RecordingObserver::default();

    let report = block_on(
        session.perform_update(&FirmwareImage::Raw(image.clone()), &observer),
    )
    .unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.completion, Completion::Idle);
    assert_eq!(report.bytes, 2050);

    let downloads = mock.downloads();
    let sizes: Vec<usize> = downloads.iter().map(|(_, d)| d.len()).collect();
    assert_eq!(sizes, vec![1024, 1024, 2, 0]);
    let blocks: Vec<u16> = downloads.iter().map(|(b, _)| *b).collect();
    assert_eq!(blocks, vec![0, 1, 2, 3]);
    assert_eq!(mock.received(), image);

    assert_eq!(observer.progress(Phase::Download), vec![1024, 2048, 2050]);
    assert!(observer.infos().contains(&"Update complete!".to_string()));

    let st = block_on(session.get_status()).unwrap();
    assert_eq!(st.state, DfuState::DfuIdle);
    assert_eq!(st.status, DfuStatusCode::Ok);
    block_on(session.close());
}

#[test]
fn chunk_count_and_progress() {
    for xfer in [1u16, 3, 64, 500] {
        for len in [1usize, 7, 64, 1000] {
            let (mock, mut session) =
                connect(MockDeviceConfig::dfu(xfer, true));
            let observer = RecordingObserver::default();
            let image = FirmwareImage::Raw(pattern(len));
            block_on(session.perform_update(&image, &observer)).unwrap();

            let expected = len.div_ceil(usize::from(xfer)) + 1;
            assert_eq!(
                mock.downloads().len(),
                expected,
                "len={len} xfer={xfer}"
            );
            assert_eq!(mock.downloads().last().map(|(_, d)| d.len()), Some(0));
            let progress = observer.progress(Phase::Download);
            assert_eq!(progress.len(), expected - 1);
            assert_eq!(progress.last(), Some(&len));
        }
    }
}

#[test]
fn retries_after_stalls() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    mock.stall_next_downloads(2);
    let observer = RecordingObserver::default();
    let image = pattern(3000);

    let report = block_on(
        session.perform_update(&FirmwareImage::Raw(image.clone()), &observer),
    )
    .unwrap();
    assert_eq!(report.attempts, 3);
    assert_eq!(observer.retries(), 2);
    assert_eq!(mock.received(), image);
    assert_eq!(mock.state(), DfuState::DfuIdle);
}

#[test]
fn permanent_stall_gives_up() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    mock.stall_next_downloads(u32::MAX);
    let observer = RecordingObserver::default();

    let err = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(3000)), &observer),
    )
    .unwrap_err();
    assert!(matches!(err, DfuError::Transport(TransportError::Stalled)));
    assert_eq!(data_downloads(&mock), 3);
    assert_eq!(observer.retries(), 2);
    assert_eq!(observer.errors().len(), 1);
    assert!(
        observer
            .infos()
            .iter()
            .any(|m| m.contains("status 15") && m.contains("transfer sizes"))
    );
    assert!(
        observer
            .infos()
            .contains(&"3. Try using a different USB port or cable".to_string())
    );
}

#[test]
fn device_error_is_not_retried() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    mock.fail_next_download(DfuStatusCode::ErrVerify);
    let observer = RecordingObserver::default();

    let err = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(3000)), &observer),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DfuError::Device {
            status: DfuStatusCode::ErrVerify,
            ..
        }
    ));
    assert_eq!(data_downloads(&mock), 1);
    assert_eq!(observer.retries(), 0);
    assert!(err.to_string().contains("Verify error"));
    assert!(err.recovery_hints().is_none());
}

#[test]
fn retry_bound_is_configurable() {
    let config = SessionConfig {
        max_retries: 5,
        ..fast_config()
    };
    let (mock, mut session) =
        connect_with(MockDeviceConfig::dfu(1024, true), config);
    mock.stall_next_downloads(4);
    let observer = RecordingObserver::default();
    let report = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(10)), &observer),
    )
    .unwrap();
    assert_eq!(report.attempts, 5);
    assert_eq!(observer.retries(), 4);
}

#[test]
fn non_tolerant_device_disconnects() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, false));
    let observer = RecordingObserver::default();

    let report = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(2000)), &observer),
    )
    .unwrap();
    assert_eq!(report.completion, Completion::AwaitingDisconnect);
    assert!(!mock.is_connected());
    assert!(
        observer
            .infos()
            .contains(&"Device disconnected after update".to_string())
    );

    // the session is invalidated and fails fast
    mock.clear_requests();
    assert!(block_on(session.get_status()).unwrap_err().is_disconnected());
    assert!(mock.requests().is_empty());
    block_on(session.close());
    assert!(!mock.is_claimed());
}

#[test]
fn small_transfers_for_zephyr_devices() {
    let mut config = MockDeviceConfig::dfu(2048, true);
    config.manufacturer = "ZEPHYR".into();
    let (mock, mut session) = connect(config);
    assert_eq!(session.transfer_size(), 512);

    let observer = RecordingObserver::default();
    let image = FirmwareImage::Raw(pattern(1500));
    block_on(session.perform_update(&image, &observer)).unwrap();
    assert!(
        observer
            .infos()
            .contains(&"Using optimized transfer size: 512 bytes".to_string())
    );
    let sizes: Vec<usize> =
        mock.downloads().iter().map(|(_, d)| d.len()).collect();
    assert_eq!(sizes, vec![512, 512, 476, 0]);
}

#[test]
fn transfer_size_override_and_fallback() {
    let config = SessionConfig {
        transfer_size: Some(256),
        ..fast_config()
    };
    let (_, session) = connect_with(MockDeviceConfig::dfu(1024, true), config);
    assert_eq!(session.transfer_size(), 256);

    let (_, session) = connect(MockDeviceConfig::dfu(0, true));
    assert_eq!(session.transfer_size(), 1024);

    let mut config = MockDeviceConfig::dfu(64, false);
    config.functional = None;
    let (_, session) = connect(config);
    assert_eq!(session.transfer_size(), 1024);
    assert!(session.functional_descriptor().manifestation_tolerant());
    assert!(session.functional_descriptor().can_upload());
}

#[test]
fn abort_twice_from_idle() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    block_on(session.abort_to_idle()).unwrap();
    assert_eq!(session.state(), DfuState::DfuIdle);
    block_on(session.abort_to_idle()).unwrap();
    assert_eq!(session.state(), DfuState::DfuIdle);

    let aborts = mock
        .requests()
        .iter()
        .filter(|r| r.request() == DFU_ABORT)
        .count();
    assert_eq!(aborts, 2);
}

#[test]
fn clear_status_from_error() {
    let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
    mock.set_state(DfuState::DfuError, DfuStatusCode::ErrWrite);
    let mut session = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        fast_config(),
    ))
    .unwrap();
    assert_eq!(session.state(), DfuState::DfuError);

    block_on(session.clear_status()).unwrap();
    assert_eq!(session.state(), DfuState::DfuIdle);
    assert!(matches!(
        block_on(session.clear_status()),
        Err(DfuError::ProtocolViolation(_))
    ));
}

#[test]
fn update_recovers_from_previous_error() {
    let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
    mock.set_state(DfuState::DfuError, DfuStatusCode::ErrStalledPkt);
    let mut session = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        fast_config(),
    ))
    .unwrap();
    let observer = RecordingObserver::default();
    let image = FirmwareImage::Raw(pattern(100));
    block_on(session.perform_update(&image, &observer)).unwrap();
    assert_eq!(mock.received(), pattern(100));
}

#[test]
fn cancellation_leaves_device_idle() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(16, true));
    let observer = RecordingObserver::default();
    session.liveness().cancel();

    let err = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(100)), &observer),
    )
    .unwrap_err();
    assert!(matches!(err, DfuError::Cancelled));
    assert_eq!(data_downloads(&mock), 0);
    assert_eq!(mock.state(), DfuState::DfuIdle);
    assert_eq!(session.state(), DfuState::DfuIdle);
}

#[test]
fn unplug_fails_fast() {
    let (mock, mut session) = connect(MockDeviceConfig::dfu(1024, true));
    mock.disconnect();
    let observer = RecordingObserver::default();

    let err = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(100)), &observer),
    )
    .unwrap_err();
    assert!(err.is_disconnected());
    assert_eq!(observer.retries(), 0);
    assert!(!session.liveness().is_connected());

    // no further transfers once the disconnect was seen
    let before = mock.requests().len();
    assert!(block_on(session.get_status()).unwrap_err().is_disconnected());
    assert_eq!(mock.requests().len(), before);
}

#[test]
fn one_session_per_device() {
    let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
    let first = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        fast_config(),
    ))
    .unwrap();

    let second = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        fast_config(),
    ));
    assert!(matches!(
        second,
        Err(DfuError::Transport(TransportError::Busy))
    ));

    block_on(first.close());
    assert!(!mock.is_claimed());
    let second = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        fast_config(),
    ));
    assert!(second.is_ok());
    assert_eq!(mock.open_count(), 3);
    assert_eq!(mock.close_count(), 2);
}

#[test]
fn missing_interface() {
    let mock = MockTransport::new(MockDeviceConfig::dfu(1024, true));
    let result = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::Name("nope".into()),
        fast_config(),
    ));
    assert!(matches!(result, Err(DfuError::NoDfuInterface)));
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn upload_until_short_read() {
    let mut config = MockDeviceConfig::dfu(1024, true);
    config.firmware = pattern(3000);
    let (mock, mut session) = connect(config);
    let observer = RecordingObserver::default();

    let data = block_on(session.upload(64 * 1024, &observer)).unwrap();
    assert_eq!(data, pattern(3000));
    assert_eq!(observer.progress(Phase::Upload), vec![1024, 2048, 3000]);
    assert_eq!(session.state(), DfuState::DfuIdle);

    // bounded by the requested size, then aborted back to idle
    let data = block_on(session.upload(1500, &observer)).unwrap();
    assert_eq!(data, pattern(1500));
    assert_eq!(mock.state(), DfuState::DfuIdle);
}

#[test]
fn detach_runtime_device() {
    let (mock, mut session) = connect(MockDeviceConfig::runtime(500));
    assert_eq!(session.state(), DfuState::AppIdle);
    assert!(session.summary().starts_with("Runtime: [2fe3:0100]"));

    block_on(session.detach()).unwrap();
    assert_eq!(mock.reset_count(), 1);
    assert_eq!(mock.state(), DfuState::DfuIdle);
    assert!(!session.liveness().is_connected());
}

#[test]
fn download_rejected_in_runtime_mode() {
    let (mock, mut session) = connect(MockDeviceConfig::runtime(500));
    let observer = RecordingObserver::default();
    let err = block_on(
        session.perform_update(&FirmwareImage::Raw(pattern(10)), &observer),
    )
    .unwrap_err();
    assert!(matches!(err, DfuError::ProtocolViolation(_)));
    assert!(
        !mock
            .requests()
            .iter()
            .any(|r| r.request() == DFU_DNLOAD)
    );
}

#[test]
fn busy_device_is_polled() {
    let mut config = MockDeviceConfig::dfu(1024, true);
    config.busy_polls = 2;
    let (mock, mut session) = connect(config);
    let observer = RecordingObserver::default();
    let image = FirmwareImage::Raw(pattern(2048));
    block_on(session.perform_update(&image, &observer)).unwrap();
    assert_eq!(mock.received(), pattern(2048));
    let polls = mock
        .requests()
        .iter()
        .filter(|r| r.request() == DFU_GETSTATUS)
        .count();
    // prep + 3 per block + manifestation
    assert_eq!(polls, 1 + 2 * 3 + 2);
}

#[test]
fn poll_timeout_is_honoured() {
    let mut config = MockDeviceConfig::dfu(1024, true);
    config.busy_polls = 2;
    config.poll_timeout_ms = 20;
    let (mock, mut session) = connect(config);
    let observer = RecordingObserver::default();

    let started = Instant::now();
    let image = FirmwareImage::Raw(pattern(10));
    block_on(session.perform_update(&image, &observer)).unwrap();
    let elapsed = started.elapsed();

    let polls = mock
        .requests()
        .iter()
        .filter(|r| r.request() == DFU_GETSTATUS)
        .count();
    // prep + 3 for the block + manifestation
    assert_eq!(polls, 1 + 3 + 2);
    // every poll after a request waits bwPollTimeout
    assert!(elapsed >= Duration::from_millis(5 * 20), "{elapsed:?}");
}

#[test]
fn stuck_device_times_out() {
    let mut config = MockDeviceConfig::dfu(1024, true);
    config.busy_polls = u32::MAX;
    config.poll_timeout_ms = 10;
    let max_poll_wait = Duration::from_millis(200);
    let session_config = SessionConfig {
        max_poll_wait,
        ..fast_config()
    };
    let (mock, mut session) = connect_with(config, session_config);
    let observer = RecordingObserver::default();

    let started = Instant::now();
    let image = FirmwareImage::Raw(pattern(100));
    let err = block_on(session.perform_update(&image, &observer)).unwrap_err();
    assert!(matches!(err, DfuError::Timeout(d) if d == max_poll_wait));
    assert!(started.elapsed() >= max_poll_wait);
    assert_eq!(observer.retries(), 0);
    assert_eq!(data_downloads(&mock), 1);
}
