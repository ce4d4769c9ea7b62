//! Failures surfaced by the session to its callers.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::traits::CameraError;

/// Result type for session operations.
pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Why a device could not be brought up.
#[derive(Debug, Error)]
pub enum InitFailure {
    /// Too many consecutive failed opens; the device was not touched.
    #[error("initialization refused after {max} consecutive failed attempts")]
    AttemptsExhausted {
        /// Configured attempt budget.
        max: u32,
    },
    /// The driver refused to open the device in every I/O mode.
    #[error("failed to open device {index}: {source}")]
    Open {
        /// Device index.
        index: u32,
        /// Error from the fallback mode.
        #[source]
        source: CameraError,
    },
    /// The device opened but never reported itself usable.
    #[error("device {index} did not report opened in any I/O mode")]
    NotOpened {
        /// Device index.
        index: u32,
    },
    /// Capture parameters could not be applied.
    #[error("failed to configure device {index}: {source}")]
    Configure {
        /// Device index.
        index: u32,
        /// Driver error.
        #[source]
        source: CameraError,
    },
    /// Too few usable frames during warm-up.
    #[error("device {index} produced {successful}/{required} usable warm-up frames")]
    WarmUp {
        /// Device index.
        index: u32,
        /// Usable frames seen.
        successful: u32,
        /// Usable frames needed.
        required: u32,
    },
}

/// Errors returned by the access arbiter and continuous-mode controller.
#[derive(Debug, Error)]
pub enum AccessError {
    /// `cleanup()` is running; nothing is queued behind it.
    #[error("camera cleanup in progress")]
    CleanupInProgress,
    /// A streaming loop is driving the device.
    #[error("video streaming is active")]
    StreamingActive,
    /// Another consumer holds the device in continuous mode.
    #[error("device held in continuous mode by {holder}")]
    ContinuousModeHeld {
        /// Diagnostic identity of the holder.
        holder: String,
    },
    /// The operation needs an idle device.
    #[error("device is busy")]
    Busy,
    /// The device could not be opened or warmed up.
    #[error("device initialization failed: {0}")]
    Initialization(#[from] InitFailure),
    /// The handle this lease pointed at was closed by reclaim, exit or cleanup.
    #[error("device handle was closed by another caller")]
    HandleClosed,
    /// A single read failed.
    #[error("transient read failure: {0}")]
    Read(#[source] CameraError),
    /// Every read of a single-shot capture failed or came back empty.
    #[error("no valid frame after {attempts} read attempts")]
    NoValidFrame {
        /// Reads attempted.
        attempts: u32,
    },
}

impl AccessError {
    /// Stable machine-readable reason, for callers that report failures over a wire.
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::CleanupInProgress => FailureReason::CleanupInProgress,
            Self::StreamingActive | Self::ContinuousModeHeld { .. } => {
                FailureReason::StreamingActive
            }
            Self::Busy => FailureReason::DeviceBusy,
            Self::Initialization(_) | Self::HandleClosed => FailureReason::DeviceUnavailable,
            Self::Read(_) | Self::NoValidFrame { .. } => FailureReason::NoValidFrame,
        }
    }
}

/// Coarse failure categories exposed to the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// See [`AccessError::CleanupInProgress`].
    CleanupInProgress,
    /// The device is being streamed.
    StreamingActive,
    /// The device could not be opened or was closed underneath the caller.
    DeviceUnavailable,
    /// No usable frame could be read.
    NoValidFrame,
    /// Reconfiguration attempted while busy.
    DeviceBusy,
}

impl FailureReason {
    /// The reason as a `snake_case` string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CleanupInProgress => "cleanup_in_progress",
            Self::StreamingActive => "streaming_active",
            Self::DeviceUnavailable => "device_unavailable",
            Self::NoValidFrame => "no_valid_frame",
            Self::DeviceBusy => "device_busy",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
