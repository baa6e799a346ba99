use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DfuError, TransportError};

/// Cooperative cancellation and disconnect channel of a session.
///
/// Clones share the same flags, so a hotplug watcher or a UI thread can hold
/// one while the session runs. The session checks it before every transfer
/// and between download chunks.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    disconnected: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate the session. Every further operation fails with
    /// `Disconnected`.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// Request cancellation at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), DfuError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flags() {
        let liveness = Liveness::new();
        let watcher = liveness.clone();
        assert!(liveness.ensure_connected().is_ok());

        assert!(!watcher.is_cancelled());
        watcher.cancel();
        assert!(liveness.is_cancelled());

        watcher.mark_disconnected();
        assert!(matches!(
            liveness.ensure_connected(),
            Err(DfuError::Transport(TransportError::Disconnected))
        ));
    }
}
