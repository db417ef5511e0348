//! External cancellation source.
//!
//! Two signal paths feed the same source: an in-process flag for
//! embedding applications, and a marker file in the data directory for
//! cross-process signaling. The work context polls the source on a fixed
//! short interval; a signal is consumed (flag cleared, file removed) the
//! first time it is observed, so a second stop on an already-terminal
//! session is a no-op.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::paths::get_data_dir;

/// Marker file name checked in the data directory.
const STOP_MARKER: &str = "stop-playback";

/// Cancellation source polled by the work context.
pub struct CancelSource {
    flag: Arc<AtomicBool>,
    marker: PathBuf,
}

impl CancelSource {
    /// Source with an explicit marker file location.
    pub fn new(marker: PathBuf) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            marker,
        }
    }

    /// Source using the well-known marker in the data directory.
    pub fn in_data_dir() -> Self {
        Self::new(get_data_dir().join(STOP_MARKER))
    }

    /// Handle for signalling cancellation from inside the process.
    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.flag),
        }
    }

    /// Check for a pending signal, consuming it if present.
    pub fn observe(&self) -> bool {
        if self.flag.swap(false, Ordering::AcqRel) {
            info!("Stop signal observed (in-process)");
            return true;
        }
        if self.marker.exists() {
            if let Err(e) = std::fs::remove_file(&self.marker) {
                debug!("Failed to remove stop marker: {}", e);
            }
            info!("Stop signal observed (marker file)");
            return true;
        }
        false
    }
}

/// Clonable in-process cancellation trigger.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation of the active session, if any.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Poll `source` every `poll` until a signal is observed, then latch the
/// session flags. `cancelled` is set before `halt` so the halt's observer
/// can always tell a cancellation from an internal abort.
pub(crate) async fn watch(
    source: Arc<CancelSource>,
    halt: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    poll: Duration,
) {
    loop {
        if source.observe() {
            cancelled.store(true, Ordering::Release);
            halt.store(true, Ordering::Release);
            return;
        }
        tokio::time::sleep(poll).await;
    }
}
