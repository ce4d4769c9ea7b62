//! Camera resource arbitration.
//!
//! A [`CameraSession`] owns the one device handle and hands out access to
//! two kinds of consumers:
//!
//! - single-shot callers ([`CameraSession::capture_one_frame`],
//!   [`CameraSession::acquire_for_single_use`]) that need one frame and are
//!   done,
//! - one continuous caller ([`CameraSession::enter_continuous_mode`]) that
//!   streams until told to stop through the [`StopSignal`].
//!
//! # Locking
//!
//! The session state sits behind an outer mutex that serialises every
//! device transition (open, close, busy, reclaim). The continuous-mode flags
//! sit behind a second, inner mutex. The inner lock is only ever taken on
//! its own or while the outer one is held, never the other way round.
//! Waiting for a busy holder uses a condition variable signalled on every
//! release.
//!
//! The device itself lives in a [`DeviceSlot`]. Closing takes the device out
//! of its slot, so a lease that still points at the slot reads
//! [`AccessError::HandleClosed`] instead of touching a dead handle.
//!
//! # Example
//!
//! ```no_run
//! use cam_arbiter::{CameraSession, SessionConfig, V4L2Opener};
//!
//! let session = CameraSession::new(V4L2Opener, SessionConfig::default());
//! match session.capture_one_frame() {
//!     Ok(frame) => println!("captured {} bytes", frame.data.len()),
//!     Err(err) => eprintln!("capture failed ({}): {err}", err.reason()),
//! }
//! session.cleanup();
//! ```

mod arbiter;
mod continuous;
mod error;
mod lifecycle;
mod status;
mod stop;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::traits::{CameraDevice, DeviceOpener, Frame};

pub use arbiter::SingleUseLease;
pub use continuous::ContinuousLease;
pub use error::{AccessError, AccessResult, FailureReason, InitFailure};
pub use status::SessionStatus;
pub use stop::StopSignal;

/// Shared cell holding an open device; emptied when the device is closed.
type DeviceSlot<D> = Arc<Mutex<Option<D>>>;

/// State guarded by the outer lock.
struct SessionState<D> {
    handle: Option<DeviceSlot<D>>,
    device_index: u32,
    busy: bool,
    last_access_at: Option<Instant>,
    init_attempts: u32,
    cleanups_running: u32,
    cleanup_epoch: u64,
}

impl<D> SessionState<D> {
    const fn cleanup_in_progress(&self) -> bool {
        self.cleanups_running > 0
    }

    fn is_current(&self, slot: &DeviceSlot<D>) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }
}

/// State guarded by the inner lock.
#[derive(Debug, Default)]
struct ContinuousState {
    continuous_mode: bool,
    streaming_active: bool,
    holder_id: Option<String>,
}

struct Shared<O: DeviceOpener> {
    opener: O,
    config: SessionConfig,
    state: Mutex<SessionState<O::Device>>,
    continuous: Mutex<ContinuousState>,
    released: Condvar,
    stop: StopSignal,
}

/// Handle to the process-wide camera session.
///
/// Construct one at startup and clone it into every consumer; clones share
/// the same device and state.
pub struct CameraSession<O: DeviceOpener> {
    shared: Arc<Shared<O>>,
}

impl<O: DeviceOpener> Clone for CameraSession<O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<O: DeviceOpener> fmt::Debug for CameraSession<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraSession")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<O: DeviceOpener> CameraSession<O> {
    /// Create a session with no open handle.
    pub fn new(opener: O, config: SessionConfig) -> Self {
        let state = SessionState {
            handle: None,
            device_index: config.device_index,
            busy: false,
            last_access_at: None,
            init_attempts: 0,
            cleanups_running: 0,
            cleanup_epoch: 0,
        };

        Self {
            shared: Arc::new(Shared {
                opener,
                config,
                state: Mutex::new(state),
                continuous: Mutex::new(ContinuousState::default()),
                released: Condvar::new(),
                stop: StopSignal::new(),
            }),
        }
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Select the device to use from now on.
    ///
    /// Closes any open handle and resets the initialization attempt budget.
    /// Refused while a holder is using the device.
    pub fn configure(&self, device_index: u32) -> AccessResult<()> {
        let mut state = self.shared.state.lock();
        if state.cleanup_in_progress() {
            return Err(AccessError::CleanupInProgress);
        }
        if state.busy {
            warn!(device_index, "refusing to reconfigure a busy camera");
            return Err(AccessError::Busy);
        }

        self.close_locked(&mut state);
        state.device_index = device_index;
        state.init_attempts = 0;
        info!(device_index, "camera device configured");
        Ok(())
    }

    /// Forcibly close everything and reset all flags.
    ///
    /// Acquisitions attempted while this runs, including callers already
    /// waiting for a busy holder, fail with [`AccessError::CleanupInProgress`].
    /// Close errors are logged and ignored; the session always ends closed.
    pub fn cleanup(&self) {
        info!("cleaning up camera resources");

        let handle = {
            let mut state = self.shared.state.lock();
            state.cleanups_running += 1;
            state.cleanup_epoch = state.cleanup_epoch.wrapping_add(1);
            *self.shared.continuous.lock() = ContinuousState::default();
            state.busy = false;
            state.handle.take()
        };
        self.shared.released.notify_all();

        if let Some(slot) = handle {
            self.close_slot(&slot);
        }

        let mut state = self.shared.state.lock();
        state.init_attempts = 0;
        state.cleanups_running -= 1;
        drop(state);
        info!("camera cleanup completed");
    }

    /// Close the current handle, if any. Flags are left to the caller.
    fn close_locked(&self, state: &mut SessionState<O::Device>) {
        if let Some(slot) = state.handle.take() {
            self.close_slot(&slot);
        }
    }

    fn close_slot(&self, slot: &DeviceSlot<O::Device>) {
        let device = slot.lock().take();
        let Some(mut device) = device else {
            return;
        };

        if let Err(err) = device.close() {
            warn!(%err, "error while closing camera device");
        }
        drop(device);
        debug!("camera handle closed");

        let settle = self.shared.config.retry.close_settle();
        if !settle.is_zero() {
            thread::sleep(settle);
        }
    }
}

/// Read one frame through a slot, failing if the device was closed.
fn read_slot<D: CameraDevice>(slot: &DeviceSlot<D>) -> AccessResult<Frame> {
    let mut guard = slot.lock();
    let device = guard.as_mut().ok_or(AccessError::HandleClosed)?;
    device.next_frame().map_err(AccessError::Read)
}

fn slot_is_open<D: CameraDevice>(slot: &DeviceSlot<D>) -> bool {
    slot.lock().as_ref().is_some_and(CameraDevice::is_opened)
}

/// Diagnostic identity of the calling thread.
fn current_holder_id() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => format!("{name} ({:?})", current.id()),
        None => format!("{:?}", current.id()),
    }
}
