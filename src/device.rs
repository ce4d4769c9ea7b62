//! V4L2 device implementation using the v4l crate.

use std::io;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::io::userptr::Stream as UserptrStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraDevice, CameraError, CaptureSettings, DeviceCapabilities, DeviceOpener, Format, FourCC,
    Frame, FrameMetadata, IoMethod, Result,
};

/// `V4L2_CID_FOCUS_AUTO` from `videodev2.h`.
const CID_FOCUS_AUTO: u32 = 0x009a_090c;

/// Buffer count used until `configure` says otherwise.
const DEFAULT_BUFFER_COUNT: u32 = 4;

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
    io_method: IoMethod,
    buffer_count: u32,
    read_timeout: Option<Duration>,
    stream: Option<V4L2Stream>,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0) with mmap streaming.
    pub fn open(index: u32) -> Result<Self> {
        Self::open_with(index, IoMethod::Mmap)
    }

    /// Open a V4L2 device by index using the given streaming I/O method.
    pub fn open_with(index: u32, io_method: IoMethod) -> Result<Self> {
        let device = Device::new(index as usize).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CameraError::DeviceNotFound(index)
            } else {
                CameraError::DeviceOpenFailed(err.to_string())
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        Ok(Self {
            device,
            capabilities,
            io_method,
            buffer_count: DEFAULT_BUFFER_COUNT,
            read_timeout: None,
            stream: None,
        })
    }

    fn apply_frame_rate(&self, frame_rate: u32) {
        if let Err(err) = self.device.set_params(&Parameters::with_fps(frame_rate)) {
            warn!(%err, frame_rate, "driver rejected frame rate");
        }
    }

    fn disable_autofocus(&self) {
        let control = Control {
            id: CID_FOCUS_AUTO,
            value: Value::Boolean(false),
        };
        if let Err(err) = self.device.set_control(control) {
            debug!(%err, "autofocus control unavailable");
        }
    }
}

impl CameraDevice for V4L2Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<Format> {
        // Buffers are negotiated against the format, so drop any running stream first.
        self.stream = None;

        let requested = settings.format();
        let actual = self.set_format(&requested)?;
        if actual.fourcc != requested.fourcc {
            return Err(CameraError::FormatNotSupported(requested));
        }

        self.apply_frame_rate(settings.frame_rate);
        if settings.disable_autofocus {
            self.disable_autofocus();
        }

        self.buffer_count = settings.buffer_count.max(1);
        self.read_timeout = Some(settings.read_timeout());

        debug!(
            width = actual.width,
            height = actual.height,
            buffers = self.buffer_count,
            "device configured"
        );
        Ok(actual)
    }

    fn is_opened(&self) -> bool {
        self.capabilities.can_capture && self.capabilities.can_stream
    }

    fn io_method(&self) -> IoMethod {
        self.io_method
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => V4L2Stream::start(
                &self.device,
                self.io_method,
                self.buffer_count,
                self.read_timeout,
            )?,
        };
        let stream = self.stream.insert(stream);
        stream.next_frame()
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.stop(),
            None => Ok(()),
        }
    }
}

/// Capture stream over either streaming I/O method.
enum V4L2Stream {
    Mmap(MmapStream<'static>),
    UserPtr(UserptrStream),
}

impl V4L2Stream {
    fn start(
        device: &Device,
        io_method: IoMethod,
        buffer_count: u32,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut stream = match io_method {
            IoMethod::Mmap => {
                MmapStream::with_buffers(device, Type::VideoCapture, buffer_count).map(Self::Mmap)
            }
            IoMethod::UserPtr => {
                UserptrStream::with_buffers(device, Type::VideoCapture, buffer_count)
                    .map(Self::UserPtr)
            }
        }
        .map_err(|err| CameraError::StreamError(err.to_string()))?;

        if let Some(timeout) = timeout {
            match &mut stream {
                Self::Mmap(inner) => inner.set_timeout(timeout),
                Self::UserPtr(inner) => inner.set_timeout(timeout),
            }
        }
        Ok(stream)
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let (buf, meta) = match self {
            Self::Mmap(inner) => inner.next(),
            Self::UserPtr(inner) => inner.next(),
        }
        .map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                CameraError::Timeout
            } else {
                CameraError::StreamError(err.to_string())
            }
        })?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Frame {
            data: buf.get(..used).unwrap_or(buf).to_vec(),
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }

    fn stop(&mut self) -> Result<()> {
        match self {
            Self::Mmap(inner) => inner.stop(),
            Self::UserPtr(inner) => inner.stop(),
        }
        .map_err(CameraError::Io)
    }
}

/// Opens [`V4L2Device`]s for the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4L2Opener;

impl DeviceOpener for V4L2Opener {
    type Device = V4L2Device;

    fn open(&self, index: u32, io_method: IoMethod) -> Result<V4L2Device> {
        V4L2Device::open_with(index, io_method)
    }
}
