//! Read-only status snapshot.

use serde::Serialize;

use super::CameraSession;
use crate::traits::{CameraDevice, DeviceOpener};

/// Point-in-time view of the session, for diagnostics and admission checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// A device handle is open.
    pub opened: bool,
    /// A holder is using the device.
    pub busy: bool,
    /// The holder is a continuous (streaming) consumer.
    pub continuous: bool,
    /// The streaming loop is running and has not been asked to stop.
    pub streaming_active: bool,
    /// Diagnostic identity of the continuous holder.
    pub holder_id: Option<String>,
    /// Configured device index.
    pub device_index: u32,
    /// Consecutive failed initialization attempts.
    pub init_attempts: u32,
    /// Attempt budget before opening is refused.
    pub max_init_attempts: u32,
    /// `cleanup()` is running.
    pub cleanup_in_progress: bool,
    /// Milliseconds since the last successful acquisition.
    pub last_access_ms_ago: Option<u64>,
}

impl SessionStatus {
    /// Whether a single-shot capture would be admitted right now.
    pub const fn accepts_single_shot(&self) -> bool {
        !self.cleanup_in_progress && !self.streaming_active
    }

    /// Whether nobody holds the device.
    pub const fn is_idle(&self) -> bool {
        !self.busy && !self.cleanup_in_progress
    }
}

impl<O: DeviceOpener> CameraSession<O> {
    /// Snapshot every session field without changing any of them.
    pub fn status(&self) -> SessionStatus {
        let state = self.shared.state.lock();
        let continuous = self.shared.continuous.lock();

        // A slot locked by the streaming loop is mid-read, so it is open.
        let opened = state.handle.as_ref().is_some_and(|slot| {
            slot.try_lock()
                .map_or(true, |device| device.as_ref().is_some_and(CameraDevice::is_opened))
        });

        SessionStatus {
            opened,
            busy: state.busy,
            continuous: continuous.continuous_mode,
            streaming_active: continuous.streaming_active,
            holder_id: continuous.holder_id.clone(),
            device_index: state.device_index,
            init_attempts: state.init_attempts,
            max_init_attempts: self.shared.config.max_init_attempts,
            cleanup_in_progress: state.cleanup_in_progress(),
            last_access_ms_ago: state
                .last_access_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }
}
