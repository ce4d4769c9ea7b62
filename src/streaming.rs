//! Streaming loop built on continuous mode.
//!
//! [`run_stream`] drives the device frame by frame on the calling thread;
//! [`StreamWorker`] runs the same loop on a dedicated thread and stops it
//! through the session's stop signal.

use std::io;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::session::{AccessError, AccessResult, CameraSession};
use crate::traits::{DeviceOpener, Frame};
use crate::validation::is_usable_frame;

/// Receives frames from the streaming loop.
///
/// `analyze` is set on every n-th frame (see
/// [`StreamConfig::analysis_interval`](crate::config::StreamConfig)) so
/// expensive per-frame work can be thinned out without dropping frames
/// from the stream itself.
pub trait FrameSink: Send {
    /// Handle one frame; `Break` ends the stream.
    fn on_frame(&mut self, frame: &Frame, analyze: bool) -> ControlFlow<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame, bool) -> ControlFlow<()> + Send,
{
    fn on_frame(&mut self, frame: &Frame, analyze: bool) -> ControlFlow<()> {
        self(frame, analyze)
    }
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stop signal was raised.
    StopSignal,
    /// The sink asked to stop.
    SinkClosed,
    /// The sink panicked.
    SinkPanicked,
    /// Too many bad reads in a row.
    TooManyFailures,
    /// The handle was closed underneath the loop (cleanup or forced exit).
    HandleClosed,
}

/// Summary of a finished stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Frames delivered to the sink.
    pub frames: u64,
    /// Bad reads tolerated along the way.
    pub read_failures: u64,
    /// Why the loop stopped.
    pub end: StreamEnd,
}

/// Stream frames into `sink` until stopped.
///
/// Enters continuous mode first and always leaves it before returning.
/// A panicking sink ends the stream with [`StreamEnd::SinkPanicked`]; the
/// counts up to that frame are kept. The stop signal is sampled once per
/// frame and is not cleared here.
pub fn run_stream<O, S>(session: &CameraSession<O>, mut sink: S) -> AccessResult<StreamReport>
where
    O: DeviceOpener,
    S: FrameSink,
{
    let config = session.config().stream.clone();
    let lease = session.enter_continuous_mode()?;

    let mut frames = 0u64;
    let mut read_failures = 0u64;
    let mut consecutive_failures = 0u32;
    let interval = u64::from(config.analysis_interval.max(1));

    let end = loop {
        if lease.stop_requested() {
            break StreamEnd::StopSignal;
        }

        match lease.read_frame() {
            Ok(frame) if is_usable_frame(&frame) => {
                consecutive_failures = 0;
                frames += 1;
                let analyze = frames % interval == 0;
                match panic::catch_unwind(AssertUnwindSafe(|| sink.on_frame(&frame, analyze))) {
                    Ok(ControlFlow::Continue(())) => continue,
                    Ok(ControlFlow::Break(())) => break StreamEnd::SinkClosed,
                    Err(_) => {
                        warn!(frame = frames, "frame sink panicked, stopping stream");
                        break StreamEnd::SinkPanicked;
                    }
                }
            }
            Ok(_) => debug!("empty frame from camera"),
            Err(AccessError::HandleClosed) => {
                warn!("camera handle closed while streaming");
                break StreamEnd::HandleClosed;
            }
            Err(err) => debug!(%err, "failed to get frame from camera"),
        }

        read_failures += 1;
        consecutive_failures += 1;
        if consecutive_failures >= config.max_consecutive_failures {
            warn!(consecutive_failures, "too many consecutive failures, stopping stream");
            break StreamEnd::TooManyFailures;
        }

        let backoff = config.failure_backoff();
        if !backoff.is_zero() {
            thread::sleep(backoff);
        }
    };

    lease.exit();
    info!(frames, read_failures, ?end, "stream ended");
    Ok(StreamReport {
        frames,
        read_failures,
        end,
    })
}

/// A streaming loop running on its own thread.
pub struct StreamWorker<O: DeviceOpener> {
    session: CameraSession<O>,
    handle: JoinHandle<AccessResult<StreamReport>>,
}

impl<O: DeviceOpener> StreamWorker<O> {
    /// Clear the stop signal and start streaming into `sink` on a new thread.
    ///
    /// Entering continuous mode happens on the worker, which becomes the
    /// recorded holder; failure to enter is reported by [`stop`](Self::stop)
    /// or [`join`](Self::join).
    pub fn spawn<S>(session: &CameraSession<O>, sink: S) -> io::Result<Self>
    where
        S: FrameSink + 'static,
    {
        session.clear_stop_signal();

        let worker_session = session.clone();
        let handle = thread::Builder::new()
            .name("camera-stream".to_owned())
            .spawn(move || run_stream(&worker_session, sink))?;

        Ok(Self {
            session: session.clone(),
            handle,
        })
    }

    /// Whether the loop has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raise the stop signal and wait for the loop to exit.
    pub fn stop(self) -> AccessResult<StreamReport> {
        self.session.raise_stop_signal();
        self.join()
    }

    /// Wait for the loop to end without signalling it.
    ///
    /// Sink panics are caught inside the loop. Should the worker thread
    /// still die by panic, it is reported as [`StreamEnd::SinkPanicked`]
    /// with zero counts, since the real ones were lost with the thread.
    pub fn join(self) -> AccessResult<StreamReport> {
        self.handle.join().unwrap_or_else(|_| {
            warn!("stream worker panicked");
            Ok(StreamReport {
                frames: 0,
                read_failures: 0,
                end: StreamEnd::SinkPanicked,
            })
        })
    }
}
