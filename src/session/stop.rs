//! Cooperative stop signal for the streaming loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::CameraSession;
use crate::traits::DeviceOpener;

/// Shared cancellation flag, sampled once per streaming iteration.
///
/// Raising it never interrupts a read in progress; the loop notices on its
/// next iteration, so allow one frame interval before relying on the device
/// being free.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    /// Create a cleared signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the streaming loop to stop.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Reset before a new streaming session.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

impl<O: DeviceOpener> CameraSession<O> {
    /// Ask the streaming loop to stop. Any caller may raise it.
    ///
    /// Streaming is reported inactive at once; the device stays held in
    /// continuous mode until the loop notices and exits.
    pub fn raise_stop_signal(&self) {
        self.shared.stop.raise();
        let mut continuous = self.shared.continuous.lock();
        if continuous.streaming_active {
            continuous.streaming_active = false;
            info!("stop signal raised, streaming winding down");
        }
    }

    /// Reset the stop signal before starting a new stream.
    pub fn clear_stop_signal(&self) {
        self.shared.stop.clear();
    }

    /// A handle to the session's stop signal for observers.
    pub fn stop_signal(&self) -> StopSignal {
        self.shared.stop.clone()
    }
}
