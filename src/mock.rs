//! Mock device implementation for testing without hardware.
//!
//! [`MockOpener`] is scripted through [`MockScript`] and records what the
//! session did to the device in [`MockStats`], including high-water marks
//! for concurrently live handles and concurrently in-flight reads.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::traits::{
    CameraDevice, CameraError, CaptureSettings, DeviceCapabilities, DeviceOpener, Format, FourCC,
    Frame, FrameMetadata, IoMethod, Result,
};

/// Behaviour injected into every device the opener produces.
#[derive(Debug, Default, Clone)]
pub struct MockScript {
    /// Number of upcoming `open` calls that fail.
    pub open_failures: u32,
    /// I/O methods whose devices open but report not opened.
    pub unopened_methods: Vec<IoMethod>,
    /// Empty frames each new device returns before real ones.
    pub empty_reads_after_open: u32,
    /// Global read indices (zero based, across all devices) that fail.
    pub failing_reads: BTreeSet<u64>,
    /// Time each read blocks for.
    pub read_delay: Duration,
}

/// Counters describing how the session used the mock.
#[derive(Debug, Default)]
pub struct MockStats {
    /// Calls to `open`, successful or not.
    pub open_calls: AtomicU32,
    /// Devices handed out.
    pub devices_opened: AtomicU32,
    /// Devices dropped.
    pub devices_dropped: AtomicU32,
    /// Explicit `close` calls.
    pub close_calls: AtomicU32,
    /// Reads issued, including failed ones.
    pub reads: AtomicU64,
    in_flight: AtomicU32,
    /// Most reads ever in flight at once.
    pub max_in_flight: AtomicU32,
    live: AtomicU32,
    /// Most devices ever alive at once.
    pub max_live: AtomicU32,
}

impl MockStats {
    /// Number of devices currently alive.
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct MockShared {
    script: Mutex<MockScript>,
    stats: MockStats,
}

/// Scriptable opener producing [`MockDevice`]s.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    shared: Arc<MockShared>,
}

impl MockOpener {
    /// Create an opener whose devices always work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an opener with the given script.
    #[must_use]
    pub fn with_script(script: MockScript) -> Self {
        let opener = Self::new();
        *opener.shared.script.lock() = script;
        opener
    }

    /// Modify the script in place.
    pub fn update_script<F: FnOnce(&mut MockScript)>(&self, update: F) {
        update(&mut self.shared.script.lock());
    }

    /// Usage counters.
    pub fn stats(&self) -> &MockStats {
        &self.shared.stats
    }
}

impl DeviceOpener for MockOpener {
    type Device = MockDevice;

    fn open(&self, index: u32, io_method: IoMethod) -> Result<MockDevice> {
        let stats = &self.shared.stats;
        stats.open_calls.fetch_add(1, Ordering::SeqCst);

        let (opened, empty_reads) = {
            let mut script = self.shared.script.lock();
            if script.open_failures > 0 {
                script.open_failures -= 1;
                return Err(CameraError::DeviceOpenFailed(format!(
                    "mock device {index} refused to open"
                )));
            }
            (
                !script.unopened_methods.contains(&io_method),
                script.empty_reads_after_open,
            )
        };

        stats.devices_opened.fetch_add(1, Ordering::SeqCst);
        let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(MockDevice {
            shared: Arc::clone(&self.shared),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: format!("mock:{index}"),
                can_capture: opened,
                can_stream: opened,
            },
            format: Format::new(64, 48, FourCC::YUYV),
            io_method,
            empty_reads_left: empty_reads,
            frame_count: 0,
        })
    }
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    shared: Arc<MockShared>,
    capabilities: DeviceCapabilities,
    format: Format,
    io_method: IoMethod,
    empty_reads_left: u32,
    frame_count: u32,
}

impl CameraDevice for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.format = format.clone();
        Ok(self.format.clone())
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<Format> {
        self.set_format(&settings.format())
    }

    fn is_opened(&self) -> bool {
        self.capabilities.can_capture
    }

    fn io_method(&self) -> IoMethod {
        self.io_method
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let stats = &self.shared.stats;
        let in_flight = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let read_index = stats.reads.fetch_add(1, Ordering::SeqCst);
        let (delay, fails) = {
            let script = self.shared.script.lock();
            (script.read_delay, script.failing_reads.contains(&read_index))
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        if fails {
            return Err(CameraError::StreamError(format!(
                "injected failure on read {read_index}"
            )));
        }

        if self.empty_reads_left > 0 {
            self.empty_reads_left -= 1;
            return Ok(Frame {
                data: Vec::new(),
                metadata: FrameMetadata {
                    sequence: 0,
                    timestamp: Duration::ZERO,
                    bytes_used: 0,
                },
            });
        }

        let seq = self.frame_count;
        self.frame_count += 1;

        #[allow(clippy::cast_possible_truncation)]
        let fill = seq as u8;
        Ok(Frame {
            data: vec![fill; self.format.size as usize],
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 66), // ~15fps
                bytes_used: self.format.size,
            },
        })
    }

    fn close(&mut self) -> Result<()> {
        self.shared.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let stats = &self.shared.stats;
        stats.live.fetch_sub(1, Ordering::SeqCst);
        stats.devices_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let opener = MockOpener::new();
        let device = opener.open(0, IoMethod::Mmap).expect("open should succeed");
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.is_opened());
        assert_eq!(opener.stats().live(), 1);

        drop(device);
        assert_eq!(opener.stats().live(), 0);
        assert_eq!(opener.stats().devices_dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mock_open_failures_are_consumed() {
        let opener = MockOpener::with_script(MockScript {
            open_failures: 2,
            ..MockScript::default()
        });

        assert!(opener.open(0, IoMethod::Mmap).is_err());
        assert!(opener.open(0, IoMethod::UserPtr).is_err());
        assert!(opener.open(0, IoMethod::Mmap).is_ok());
        assert_eq!(opener.stats().open_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_mock_unopened_method() {
        let opener = MockOpener::with_script(MockScript {
            unopened_methods: vec![IoMethod::Mmap],
            ..MockScript::default()
        });

        let mmap = opener.open(0, IoMethod::Mmap).expect("open should succeed");
        assert!(!mmap.is_opened());
        let userptr = opener.open(0, IoMethod::UserPtr).expect("open should succeed");
        assert!(userptr.is_opened());
        assert_eq!(userptr.io_method(), IoMethod::UserPtr);
    }

    #[test]
    fn test_mock_empty_then_real_frames() {
        let opener = MockOpener::with_script(MockScript {
            empty_reads_after_open: 2,
            ..MockScript::default()
        });
        let mut device = opener.open(0, IoMethod::Mmap).expect("open should succeed");

        assert!(device.next_frame().expect("read").data.is_empty());
        assert!(device.next_frame().expect("read").data.is_empty());

        let frame = device.next_frame().expect("read");
        assert_eq!(frame.metadata.sequence, 0);
        assert_eq!(frame.data.len(), 64 * 48 * 2);
    }

    #[test]
    fn test_mock_injected_read_failure() {
        let opener = MockOpener::with_script(MockScript {
            failing_reads: BTreeSet::from([1]),
            ..MockScript::default()
        });
        let mut device = opener.open(0, IoMethod::Mmap).expect("open should succeed");

        assert!(device.next_frame().is_ok());
        assert!(device.next_frame().is_err());
        let frame = device.next_frame().expect("read");
        assert_eq!(frame.metadata.sequence, 1);
        assert_eq!(opener.stats().max_in_flight.load(Ordering::SeqCst), 1);
    }
}
