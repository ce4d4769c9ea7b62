//! Continuous-use mode for the streaming consumer.

use std::fmt;

use tracing::{debug, info};

use super::{
    current_holder_id, read_slot, AccessError, AccessResult, CameraSession, ContinuousState,
    DeviceSlot, SessionState,
};
use crate::traits::{DeviceOpener, Frame};

impl<O: DeviceOpener> CameraSession<O> {
    /// Take the device for sustained, frame-by-frame use.
    ///
    /// The device is opened and flagged continuous under one lock, so it is
    /// never eligible for the single-shot timeout reclaim. Fails if another
    /// continuous session is already active. If the stop signal is already
    /// raised the device is still taken, but streaming is not reported
    /// active.
    pub fn enter_continuous_mode(&self) -> AccessResult<ContinuousLease<O>> {
        let mut state = self.shared.state.lock();
        if let Some(holder) = self.continuous_holder() {
            debug!(%holder, "continuous mode already held");
            return Err(AccessError::ContinuousModeHeld { holder });
        }

        let slot = self.acquire_locked(&mut state)?;
        let holder = current_holder_id();
        {
            let mut continuous = self.shared.continuous.lock();
            continuous.continuous_mode = true;
            continuous.streaming_active = !self.shared.stop.is_raised();
            continuous.holder_id = Some(holder.clone());
        }
        drop(state);

        info!(%holder, "entered continuous camera mode");
        Ok(ContinuousLease {
            session: self.clone(),
            slot,
            exited: false,
        })
    }

    /// Leave continuous mode and close the device.
    ///
    /// Idempotent, and unconditional: afterwards the device is closed and not
    /// busy whatever state it was in.
    pub fn exit_continuous_mode(&self) {
        let mut state = self.shared.state.lock();
        self.exit_locked(&mut state);
    }

    fn exit_locked(&self, state: &mut SessionState<O::Device>) {
        let was_continuous = {
            let mut continuous = self.shared.continuous.lock();
            let was_continuous = continuous.continuous_mode;
            *continuous = ContinuousState::default();
            was_continuous
        };

        self.close_locked(state);
        state.busy = false;
        self.shared.released.notify_all();

        if was_continuous {
            info!("exited continuous camera mode");
        } else {
            debug!("continuous exit requested outside continuous mode");
        }
    }

    fn continuous_holder(&self) -> Option<String> {
        let continuous = self.shared.continuous.lock();
        continuous
            .continuous_mode
            .then(|| continuous.holder_id.clone().unwrap_or_default())
    }
}

/// Exclusive continuous access to the device.
///
/// Reads go straight to the device without taking the session lock.
/// Dropping the lease exits continuous mode, so a streaming loop that ends
/// by error or panic still frees the device. A lease whose handle was
/// already closed by cleanup or an explicit exit leaves any newer session
/// untouched.
pub struct ContinuousLease<O: DeviceOpener> {
    session: CameraSession<O>,
    slot: DeviceSlot<O::Device>,
    exited: bool,
}

impl<O: DeviceOpener> ContinuousLease<O> {
    /// Read one frame from the held device.
    pub fn read_frame(&self) -> AccessResult<Frame> {
        read_slot(&self.slot)
    }

    /// Whether the session's stop signal has been raised.
    pub fn stop_requested(&self) -> bool {
        self.session.shared.stop.is_raised()
    }

    /// The session this lease belongs to.
    pub const fn session(&self) -> &CameraSession<O> {
        &self.session
    }

    /// Leave continuous mode and close the device.
    pub fn exit(mut self) {
        self.exit_inner();
    }

    fn exit_inner(&mut self) {
        if std::mem::replace(&mut self.exited, true) {
            return;
        }

        let mut state = self.session.shared.state.lock();
        if state.is_current(&self.slot) {
            self.session.exit_locked(&mut state);
        } else {
            debug!("continuous lease outlived its handle");
        }
    }
}

impl<O: DeviceOpener> Drop for ContinuousLease<O> {
    fn drop(&mut self) {
        self.exit_inner();
    }
}

impl<O: DeviceOpener> fmt::Debug for ContinuousLease<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousLease")
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}
