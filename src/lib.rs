//! cam-arbiter: exclusive, fault-tolerant access to a single V4L2 camera.
//!
//! One physical device is shared between single-shot capture callers and a
//! single continuous streaming consumer. [`CameraSession`] arbitrates
//! between them, recovers from stuck holders, and bounds how often a broken
//! device is retried. Hardware access goes through the [`CameraDevice`] and
//! [`DeviceOpener`] traits so the arbitration logic can be tested with mock
//! devices.

pub mod config;
pub mod device;
pub mod session;
pub mod streaming;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::{ConfigError, SessionConfig};
pub use device::{V4L2Device, V4L2Opener};
pub use session::{
    AccessError, AccessResult, CameraSession, ContinuousLease, FailureReason, InitFailure,
    SessionStatus, SingleUseLease, StopSignal,
};
pub use streaming::{run_stream, FrameSink, StreamEnd, StreamReport, StreamWorker};
pub use traits::{
    CameraDevice, CameraError, CaptureSettings, DeviceCapabilities, DeviceOpener, Format, FourCC,
    Frame, FrameMetadata, IoMethod, PixelFormat,
};
