#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use futures::executor::block_on;
use udfu::transport::MockDeviceConfig;
use udfu::{
    DfuEvent, DfuObserver, DfuSession, InterfaceSelector, MockTransport,
    Phase, SessionConfig,
};

/// Observer keeping every event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn retries(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, DfuEvent::Retry { .. }))
            .count()
    }

    pub fn progress(&self, phase: Phase) -> Vec<usize> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                DfuEvent::Progress { phase: p, done, .. } if *p == phase => {
                    Some(*done)
                }
                _ => None,
            })
            .collect()
    }

    pub fn infos(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::Info(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::Error(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Route `log` output through the test harness, `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Session settings without any real waiting.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        settle_delay: Duration::ZERO,
        retry_backoff: Duration::ZERO,
        max_poll_wait: Duration::from_secs(1),
        disconnect_timeout: Duration::ZERO,
        ..SessionConfig::default()
    }
}

pub fn connect(
    config: MockDeviceConfig,
) -> (MockTransport, DfuSession<MockTransport>) {
    connect_with(config, fast_config())
}

pub fn connect_with(
    config: MockDeviceConfig,
    session_config: SessionConfig,
) -> (MockTransport, DfuSession<MockTransport>) {
    init_logging();
    let mock = MockTransport::new(config);
    let session = block_on(DfuSession::connect(
        mock.clone(),
        &InterfaceSelector::First,
        session_config,
    ))
    .unwrap();
    mock.clear_requests();
    (mock, session)
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
