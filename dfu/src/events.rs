//! Events reported by a session while it works.
//!
//! Rendering is left to the caller: a CLI draws a progress bar, a GUI feeds
//! a log pane, tests record them.

use std::fmt;

/// Operation a [`DfuEvent::Progress`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Erase,
    Download,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Erase => write!(f, "Erasing"),
            Phase::Download => write!(f, "Downloading"),
            Phase::Upload => write!(f, "Uploading"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    Progress {
        phase: Phase,
        done: usize,
        total: usize,
    },
    Info(String),
    Warning(String),
    Error(String),
    /// A recoverable failure is about to be retried.
    Retry { attempt: u32, max_attempts: u32 },
}

/// Receiver of [`DfuEvent`]s.
pub trait DfuObserver: Send + Sync {
    fn on_event(&self, event: &DfuEvent);
}

/// Discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Forwards events to the `log` facade.
pub struct LogObserver;

impl DfuObserver for LogObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Progress { phase, done, total } => {
                log::debug!("{phase}: {done}/{total}")
            }
            DfuEvent::Info(msg) => log::info!("{msg}"),
            DfuEvent::Warning(msg) => log::warn!("{msg}"),
            DfuEvent::Error(msg) => log::error!("{msg}"),
            DfuEvent::Retry {
                attempt,
                max_attempts,
            } => log::info!("Retry attempt {attempt}/{max_attempts}"),
        }
    }
}

impl<O: DfuObserver + ?Sized> DfuObserver for &O {
    fn on_event(&self, event: &DfuEvent) {
        (**self).on_event(event)
    }
}

impl<O: DfuObserver + ?Sized> DfuObserver for std::sync::Arc<O> {
    fn on_event(&self, event: &DfuEvent) {
        (**self).on_event(event)
    }
}
