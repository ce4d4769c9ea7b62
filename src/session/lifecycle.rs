//! Device handle lifecycle: open with fallback, configure, warm up, retry budget.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{AccessResult, CameraSession, DeviceSlot, InitFailure, SessionState};
use crate::config::{SessionConfig, WarmUpPolicy};
use crate::traits::{CameraDevice, DeviceOpener, IoMethod};
use crate::validation::is_usable_frame;

impl<O: DeviceOpener> CameraSession<O> {
    /// Open the configured device, charging one attempt against the budget.
    ///
    /// Once the budget is spent the device is not touched again until
    /// `configure` or `cleanup` resets the counter.
    pub(super) fn open_locked(
        &self,
        state: &mut SessionState<O::Device>,
    ) -> AccessResult<DeviceSlot<O::Device>> {
        let config = &self.shared.config;
        let index = state.device_index;

        state.init_attempts = state.init_attempts.saturating_add(1);
        if state.init_attempts > config.max_init_attempts {
            warn!(
                device_index = index,
                attempts = state.init_attempts,
                max = config.max_init_attempts,
                "camera initialization budget exhausted"
            );
            return Err(InitFailure::AttemptsExhausted {
                max: config.max_init_attempts,
            }
            .into());
        }

        match open_device(&self.shared.opener, index, config) {
            Ok(device) => {
                state.init_attempts = 0;
                let slot = Arc::new(Mutex::new(Some(device)));
                state.handle = Some(Arc::clone(&slot));
                Ok(slot)
            }
            Err(failure) => {
                error!(
                    device_index = index,
                    attempt = state.init_attempts,
                    %failure,
                    "camera initialization failed"
                );
                let backoff = config.retry.open_failure_backoff();
                if !backoff.is_zero() {
                    thread::sleep(backoff);
                }
                Err(failure.into())
            }
        }
    }
}

/// Open, configure and warm up a device.
fn open_device<O: DeviceOpener>(
    opener: &O,
    index: u32,
    config: &SessionConfig,
) -> Result<O::Device, InitFailure> {
    info!(device_index = index, "initializing camera");

    let mut device = open_with_fallback(opener, index)?;
    device
        .configure(&config.capture)
        .map_err(|source| InitFailure::Configure { index, source })?;

    let settle = config.warm_up.settle();
    if !settle.is_zero() {
        thread::sleep(settle);
    }

    warm_up(&mut device, &config.warm_up, index)?;
    Ok(device)
}

fn open_with_fallback<O: DeviceOpener>(opener: &O, index: u32) -> Result<O::Device, InitFailure> {
    match opener.open(index, IoMethod::PRIMARY) {
        Ok(device) if device.is_opened() => return Ok(device),
        Ok(_) => debug!(
            device_index = index,
            "primary I/O mode did not report opened, trying fallback"
        ),
        Err(err) => debug!(
            device_index = index,
            %err,
            "primary I/O mode failed, trying fallback"
        ),
    }

    let device = opener
        .open(index, IoMethod::FALLBACK)
        .map_err(|source| InitFailure::Open { index, source })?;
    if device.is_opened() {
        Ok(device)
    } else {
        Err(InitFailure::NotOpened { index })
    }
}

/// Discard early reads until enough usable frames arrive.
fn warm_up<D: CameraDevice>(
    device: &mut D,
    policy: &WarmUpPolicy,
    index: u32,
) -> Result<(), InitFailure> {
    if policy.required_reads == 0 {
        return Ok(());
    }

    let mut successful = 0;
    for attempt in 1..=policy.max_reads {
        match device.next_frame() {
            Ok(frame) if is_usable_frame(&frame) => {
                successful += 1;
                if successful >= policy.required_reads {
                    info!(
                        device_index = index,
                        io_method = ?device.io_method(),
                        reads = attempt,
                        "camera ready"
                    );
                    return Ok(());
                }
            }
            Ok(_) => debug!(device_index = index, attempt, "empty warm-up frame"),
            Err(err) => debug!(device_index = index, attempt, %err, "warm-up read failed"),
        }

        let interval = policy.read_interval();
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    warn!(
        device_index = index,
        successful,
        required = policy.required_reads,
        "camera opened but not delivering frames"
    );
    Err(InitFailure::WarmUp {
        index,
        successful,
        required: policy.required_reads,
    })
}
