//! Core traits and types for the camera device abstraction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Pixel formats selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, the format every UVC webcam offers.
    #[default]
    Yuyv,
    /// Motion JPEG.
    Mjpg,
    /// 24-bit RGB.
    Rgb3,
}

impl From<PixelFormat> for FourCC {
    fn from(format: PixelFormat) -> Self {
        match format {
            PixelFormat::Yuyv => Self::YUYV,
            PixelFormat::Mjpg => Self::MJPG,
            PixelFormat::Rgb3 => Self::RGB3,
        }
    }
}

/// Video format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width * 2; // YUYV is 2 bytes per pixel
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Streaming I/O method used to move frames out of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMethod {
    /// Driver-allocated buffers mapped into our address space.
    Mmap,
    /// Application-allocated buffers handed to the driver.
    UserPtr,
}

impl IoMethod {
    /// The mode tried first when opening a device.
    pub const PRIMARY: Self = Self::Mmap;
    /// The mode tried when the primary one fails to open.
    pub const FALLBACK: Self = Self::UserPtr;
}

/// Capture parameters applied to a freshly opened device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Requested frames per second.
    pub frame_rate: u32,
    /// Requested pixel format.
    pub pixel_format: PixelFormat,
    /// Number of driver buffers; kept minimal so reads return fresh frames.
    pub buffer_count: u32,
    /// Upper bound on a single blocking read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Turn continuous autofocus off (best effort).
    pub disable_autofocus: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 15,
            pixel_format: PixelFormat::Yuyv,
            buffer_count: 1,
            read_timeout_ms: 2_000,
            disable_autofocus: true,
        }
    }
}

impl CaptureSettings {
    /// The format these settings request from the driver.
    #[must_use]
    pub fn format(&self) -> Format {
        Format::new(self.width, self.height, self.pixel_format.into())
    }

    /// Read timeout as a [`Duration`].
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video frame.
///
/// The buffer is opaque to this crate; callers encode it for transport.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given index was not found.
    #[error("Device {0} not found")]
    DeviceNotFound(u32),
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Requested format is not supported.
    #[error("Format not supported: {0:?}")]
    FormatNotSupported(Format),
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over an opened camera device.
///
/// A device owns its capture stream, so it can be stored in the session and
/// moved between threads.
pub trait CameraDevice: Send {
    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Apply format, frame rate, buffering and focus settings.
    fn configure(&mut self, settings: &CaptureSettings) -> Result<Format>;

    /// Whether the driver reports the device as open and able to stream.
    fn is_opened(&self) -> bool;

    /// The streaming I/O method this handle was opened with.
    fn io_method(&self) -> IoMethod;

    /// Capture the next frame, starting the stream on first use.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Stop streaming and release driver buffers.
    fn close(&mut self) -> Result<()>;
}

/// Opens devices by index; the session's only way to obtain a handle.
pub trait DeviceOpener: Send + Sync + 'static {
    /// The device type produced by this opener.
    type Device: CameraDevice + 'static;

    /// Open the device at `index` using the given streaming I/O method.
    fn open(&self, index: u32, io_method: IoMethod) -> Result<Self::Device>;
}
