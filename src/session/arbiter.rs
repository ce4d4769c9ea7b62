//! Access arbiter: exclusive single-shot access, contention timeout and forced reclaim.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use super::{
    read_slot, slot_is_open, AccessError, AccessResult, CameraSession, ContinuousState,
    DeviceSlot, SessionState,
};
use crate::traits::{DeviceOpener, Frame};
use crate::validation::is_usable_frame;

impl<O: DeviceOpener> CameraSession<O> {
    /// Take the device for a short, non-continuous use.
    ///
    /// If another single-shot holder has it, waits up to the configured
    /// access timeout and then reclaims it by force. The returned lease
    /// releases the device when dropped.
    pub fn acquire_for_single_use(&self) -> AccessResult<SingleUseLease<O>> {
        let mut state = self.shared.state.lock();
        let slot = self.acquire_locked(&mut state)?;
        Ok(SingleUseLease {
            session: self.clone(),
            slot,
            released: false,
        })
    }

    /// Release the device after single-shot use.
    ///
    /// Does nothing in continuous mode; continuous holders leave through
    /// [`exit_continuous_mode`](Self::exit_continuous_mode).
    pub fn release(&self) {
        let mut state = self.shared.state.lock();
        self.release_locked(&mut state);
    }

    /// Capture one usable frame and release the device.
    ///
    /// Refused without touching the device while a stream is active. Reads
    /// happen under the session lock, so concurrent callers queue behind a
    /// slow device rather than racing it.
    pub fn capture_one_frame(&self) -> AccessResult<Frame> {
        let mut state = self.shared.state.lock();
        if self.shared.continuous.lock().streaming_active {
            debug!("streaming active, refusing single-shot capture");
            return Err(AccessError::StreamingActive);
        }

        let slot = self.acquire_locked(&mut state)?;
        let frame = self.read_with_retries(&slot);
        self.release_locked(&mut state);
        frame
    }

    /// Grant the device to the caller, opening it if needed.
    pub(super) fn acquire_locked(
        &self,
        state: &mut MutexGuard<'_, SessionState<O::Device>>,
    ) -> AccessResult<DeviceSlot<O::Device>> {
        if state.cleanup_in_progress() {
            warn!("camera cleanup in progress, cannot access camera");
            return Err(AccessError::CleanupInProgress);
        }
        if state.busy {
            self.wait_for_release(state)?;
        }

        let reusable = state
            .handle
            .as_ref()
            .filter(|slot| slot_is_open(slot))
            .map(Arc::clone);
        let slot = match reusable {
            Some(slot) => slot,
            None => {
                if state.handle.is_some() {
                    warn!("camera handle no longer open, reinitializing");
                    self.close_locked(state);
                }
                self.open_locked(state)?
            }
        };

        state.busy = true;
        state.last_access_at = Some(Instant::now());
        Ok(slot)
    }

    /// Block until the current holder releases, reclaiming from a stuck
    /// single-shot holder once the access timeout passes.
    fn wait_for_release(
        &self,
        state: &mut MutexGuard<'_, SessionState<O::Device>>,
    ) -> AccessResult<()> {
        {
            let continuous = self.shared.continuous.lock();
            if continuous.streaming_active {
                return Err(AccessError::StreamingActive);
            }
        }

        let epoch = state.cleanup_epoch;
        let timeout = self.shared.config.access_timeout();
        let deadline = Instant::now() + timeout;
        debug!(?timeout, "camera busy, waiting for release");

        while state.busy && state.cleanup_epoch == epoch {
            if self.shared.released.wait_until(state, deadline).timed_out() {
                break;
            }
        }

        if state.cleanup_epoch != epoch || state.cleanup_in_progress() {
            return Err(AccessError::CleanupInProgress);
        }
        if !state.busy {
            return Ok(());
        }

        // Continuous holders are exempt from reclaim.
        {
            let continuous = self.shared.continuous.lock();
            if continuous.continuous_mode {
                return Err(AccessError::ContinuousModeHeld {
                    holder: continuous.holder_id.clone().unwrap_or_default(),
                });
            }
        }

        warn!(?timeout, "camera access timeout, reclaiming from stuck holder");
        self.force_reclaim_locked(state);
        Ok(())
    }

    /// Close the handle and reset every holder flag. Never fails.
    fn force_reclaim_locked(&self, state: &mut SessionState<O::Device>) {
        self.close_locked(state);
        state.busy = false;
        *self.shared.continuous.lock() = ContinuousState::default();
        self.shared.released.notify_all();
    }

    pub(super) fn release_locked(&self, state: &mut SessionState<O::Device>) {
        if self.shared.continuous.lock().continuous_mode {
            debug!("camera in continuous use, not releasing");
            return;
        }

        self.close_locked(state);
        state.busy = false;
        self.shared.released.notify_all();
        debug!("camera released");
    }

    fn read_with_retries(&self, slot: &DeviceSlot<O::Device>) -> AccessResult<Frame> {
        let retry = &self.shared.config.retry;

        for attempt in 1..=retry.read_attempts {
            match read_slot(slot) {
                Ok(frame) if is_usable_frame(&frame) => return Ok(frame),
                Ok(_) => debug!(attempt, "read returned an empty frame"),
                Err(AccessError::HandleClosed) => return Err(AccessError::HandleClosed),
                Err(err) => warn!(attempt, %err, "frame read failed"),
            }

            let backoff = retry.read_backoff();
            if attempt < retry.read_attempts && !backoff.is_zero() {
                thread::sleep(backoff);
            }
        }

        warn!(
            attempts = retry.read_attempts,
            "failed to capture a valid frame"
        );
        Err(AccessError::NoValidFrame {
            attempts: retry.read_attempts,
        })
    }
}

/// Exclusive single-shot access to the device.
///
/// Released by [`release`](Self::release) or on drop. If the arbiter
/// reclaimed the device in the meantime, reads fail with
/// [`AccessError::HandleClosed`] and releasing is a no-op.
pub struct SingleUseLease<O: DeviceOpener> {
    session: CameraSession<O>,
    slot: DeviceSlot<O::Device>,
    released: bool,
}

impl<O: DeviceOpener> SingleUseLease<O> {
    /// Read one frame from the held device.
    pub fn read_frame(&self) -> AccessResult<Frame> {
        read_slot(&self.slot)
    }

    /// Whether this lease still holds the session's current handle.
    pub fn is_current(&self) -> bool {
        self.session.shared.state.lock().is_current(&self.slot)
    }

    /// Give the device back.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        let mut state = self.session.shared.state.lock();
        if state.is_current(&self.slot) {
            self.session.release_locked(&mut state);
        } else {
            debug!("single-use lease was reclaimed before release");
        }
    }
}

impl<O: DeviceOpener> Drop for SingleUseLease<O> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<O: DeviceOpener> fmt::Debug for SingleUseLease<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUseLease")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{MockOpener, MockScript};
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn session(opener: &MockOpener) -> CameraSession<MockOpener> {
        CameraSession::new(opener.clone(), SessionConfig::immediate())
    }

    #[test]
    fn test_capture_after_slow_warm_up_closes_device() {
        let opener = MockOpener::with_script(MockScript {
            empty_reads_after_open: 4,
            ..MockScript::default()
        });
        let session = session(&opener);
        session.configure(0).expect("configure should succeed");

        let frame = session.capture_one_frame().expect("capture should succeed");
        assert!(!frame.data.is_empty());

        let status = session.status();
        assert!(!status.opened);
        assert!(!status.busy);
        assert_eq!(opener.stats().live(), 0);
        assert!(status.last_access_ms_ago.is_some());
    }

    #[test]
    fn test_capture_retries_transient_failures() {
        // Warm-up consumes reads 0..=2; the first two capture reads fail.
        let opener = MockOpener::with_script(MockScript {
            failing_reads: BTreeSet::from([3, 4]),
            ..MockScript::default()
        });
        let session = session(&opener);

        assert!(session.capture_one_frame().is_ok());
        assert_eq!(opener.stats().reads.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_capture_gives_up_after_five_reads() {
        let opener = MockOpener::with_script(MockScript {
            failing_reads: (3..100).collect(),
            ..MockScript::default()
        });
        let session = session(&opener);

        let err = session.capture_one_frame().expect_err("reads all fail");
        assert!(matches!(err, AccessError::NoValidFrame { attempts: 5 }));
        assert_eq!(err.reason().as_str(), "no_valid_frame");
        assert_eq!(opener.stats().reads.load(Ordering::SeqCst), 8);
        assert!(!session.status().busy, "failed capture must still release");
    }

    #[test]
    fn test_capture_refused_while_streaming() {
        let opener = MockOpener::new();
        let session = session(&opener);

        let lease = session
            .enter_continuous_mode()
            .expect("enter should succeed");
        let reads = opener.stats().reads.load(Ordering::SeqCst);
        let opens = opener.stats().open_calls.load(Ordering::SeqCst);

        let err = session.capture_one_frame().expect_err("must be refused");
        assert!(matches!(err, AccessError::StreamingActive));
        assert_eq!(err.reason().as_str(), "streaming_active");
        assert_eq!(opener.stats().reads.load(Ordering::SeqCst), reads);
        assert_eq!(opener.stats().open_calls.load(Ordering::SeqCst), opens);

        lease.exit();
    }

    #[test]
    fn test_release_is_noop_in_continuous_mode() {
        let opener = MockOpener::new();
        let session = session(&opener);

        let lease = session
            .enter_continuous_mode()
            .expect("enter should succeed");
        session.release();

        let status = session.status();
        assert!(status.opened);
        assert!(status.busy);
        assert!(status.continuous);
        assert!(lease.read_frame().is_ok());
    }

    #[test]
    fn test_lease_release_closes_device() {
        let opener = MockOpener::new();
        let session = session(&opener);

        let lease = session
            .acquire_for_single_use()
            .expect("acquire should succeed");
        assert!(session.status().busy);
        assert!(lease.is_current());
        assert!(lease.read_frame().is_ok());

        lease.release();
        assert!(!session.status().busy);
        assert!(!session.status().opened);
        assert_eq!(opener.stats().live(), 0);
    }

    #[test]
    fn test_concurrent_captures_never_overlap() {
        let opener = MockOpener::with_script(MockScript {
            read_delay: Duration::from_millis(2),
            ..MockScript::default()
        });
        let session = CameraSession::new(
            opener.clone(),
            SessionConfig {
                access_timeout_ms: 10_000,
                ..SessionConfig::immediate()
            },
        );

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let session = session.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..3)
                        .map(|_| session.capture_one_frame().is_ok())
                        .all(|ok| ok)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("worker panicked"));
        }

        let stats = opener.stats();
        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(stats.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(stats.devices_opened.load(Ordering::SeqCst), 24);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_waiter_gets_device_on_release() {
        let opener = MockOpener::new();
        let session = CameraSession::new(
            opener.clone(),
            SessionConfig {
                access_timeout_ms: 10_000,
                ..SessionConfig::immediate()
            },
        );

        let lease = session
            .acquire_for_single_use()
            .expect("acquire should succeed");
        let waiter = {
            let session = session.clone();
            thread::spawn(move || session.capture_one_frame().is_ok())
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        lease.release();

        assert!(waiter.join().expect("waiter panicked"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(opener.stats().max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn test_stuck_holder_is_reclaimed() {
        let opener = MockOpener::new();
        let session = session(&opener);

        let stuck = session
            .acquire_for_single_use()
            .expect("acquire should succeed");

        // The holder never releases; the next caller waits out the timeout.
        let started = Instant::now();
        let frame = session.capture_one_frame();
        assert!(frame.is_ok(), "caller must succeed after reclaim: {frame:?}");
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(logs_contain("reclaiming from stuck holder"));

        assert!(!stuck.is_current());
        assert!(matches!(stuck.read_frame(), Err(AccessError::HandleClosed)));
        assert_eq!(
            stuck.read_frame().expect_err("handle is gone").reason().as_str(),
            "device_unavailable"
        );

        // Dropping the stale lease must not disturb the session.
        let lease = session
            .acquire_for_single_use()
            .expect("acquire should succeed");
        drop(stuck);
        assert!(lease.is_current());
        assert!(session.status().busy);
        assert_eq!(opener.stats().max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_fails_waiting_caller() {
        let opener = MockOpener::new();
        let session = CameraSession::new(
            opener.clone(),
            SessionConfig {
                access_timeout_ms: 10_000,
                ..SessionConfig::immediate()
            },
        );

        let holder = session
            .acquire_for_single_use()
            .expect("acquire should succeed");
        let waiter = {
            let session = session.clone();
            thread::spawn(move || session.capture_one_frame())
        };

        thread::sleep(Duration::from_millis(50));
        session.cleanup();

        let result = waiter.join().expect("waiter panicked");
        assert!(
            matches!(result, Err(AccessError::CleanupInProgress)),
            "{result:?}"
        );
        assert!(matches!(holder.read_frame(), Err(AccessError::HandleClosed)));
        assert!(!session.status().busy);
    }
}
