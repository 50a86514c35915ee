//! Driver loop: capture, filter, sink, release, one frame at a time

mod stats;

pub use stats::PipelineStats;

use crate::capture::CaptureSource;
use crate::filter::Filter;
use crate::output::{Sink, SinkError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Frames between two statistics log lines.
pub const STATS_INTERVAL_FRAMES: u64 = 100;

/// Shared stop request, checked by the loop between frames.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The run flag was cleared
    Stopped,
    /// The capture source failed to deliver a frame
    EndOfStream,
    /// The sink could not write anymore
    SinkClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub reason: StopReason,
    pub stats: PipelineStats,
}

enum Outcome {
    Delivered(usize),
    Skipped,
    SinkFailed(SinkError),
}

/// One capture source, one filter and one sink bound together.
pub struct Session<S: CaptureSource> {
    source: S,
    filter: Box<dyn Filter + Send>,
    sink: Box<dyn Sink + Send>,
    stats: PipelineStats,
}

impl<S: CaptureSource> Session<S> {
    pub fn new(source: S, filter: Box<dyn Filter + Send>, sink: Box<dyn Sink + Send>) -> Self {
        Self {
            source,
            filter,
            sink,
            stats: PipelineStats::default(),
        }
    }

    /// Runs until stopped, then tears everything down.
    ///
    /// `flag` is only looked at between frames; a blocked capture has to
    /// return on its own first.
    pub fn run(mut self, flag: &RunFlag) -> SessionReport {
        info!(format = %self.source.format(), "Streaming started");

        let mut window_start = Instant::now();
        let mut window_stats = self.stats.clone();

        let reason = loop {
            if !flag.is_running() {
                break StopReason::Stopped;
            }
            if let Some(reason) = self.step() {
                break reason;
            }

            if self.stats.frames > window_stats.frames
                && self.stats.frames % STATS_INTERVAL_FRAMES == 0
            {
                let fps = self
                    .stats
                    .calculate_fps(&window_stats, window_start.elapsed().as_secs_f64());
                info!(
                    frames = self.stats.frames,
                    bytes_out = self.stats.bytes_out,
                    avg_frame = self.stats.average_frame_size(),
                    fps = %format!("{:.1}", fps),
                    "Pipeline stats"
                );
                window_start = Instant::now();
                window_stats = self.stats.clone();
            }
        };

        info!(
            ?reason,
            frames = self.stats.frames,
            bytes_out = self.stats.bytes_out,
            skipped = self.stats.frames_skipped,
            release_faults = self.stats.release_faults,
            "Streaming stopped"
        );

        let stats = self.stats.clone();
        self.teardown();
        SessionReport { reason, stats }
    }

    /// Moves one frame through the pipeline. `Some` ends the session.
    fn step(&mut self) -> Option<StopReason> {
        let handle = match self.source.capture_frame() {
            Ok(handle) => handle,
            Err(e) => {
                info!(error = %e, "Capture ended");
                return Some(StopReason::EndOfStream);
            }
        };

        // the sink reads straight from the slot (passthrough) or the filter,
        // so the slot is released only after this block
        let outcome = match self.source.frame(&handle) {
            Ok(bytes) => match self.filter.put_frame(bytes) {
                Ok(mut filtered) => {
                    let size = filtered.size();
                    match self.sink.put_frame(&mut filtered) {
                        Ok(()) => Outcome::Delivered(size),
                        Err(e) => Outcome::SinkFailed(e),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Filter failed, dropping frame");
                    Outcome::Skipped
                }
            },
            Err(e) => {
                warn!(error = %e, "Captured frame not readable");
                Outcome::Skipped
            }
        };

        if self.source.release_frame(handle).is_err() {
            self.stats.release_faults += 1;
        }

        match outcome {
            Outcome::Delivered(size) => {
                self.stats.frames += 1;
                self.stats.bytes_out += size as u64;
                debug!(frame = self.stats.frames, size, "Frame delivered");
                None
            }
            Outcome::Skipped => {
                self.stats.frames_skipped += 1;
                None
            }
            Outcome::SinkFailed(e) => {
                warn!(error = %e, "Output failed");
                Some(StopReason::SinkClosed)
            }
        }
    }

    /// Sink first, then filter, then the capture device.
    fn teardown(self) {
        let Session {
            mut source,
            filter,
            sink,
            ..
        } = self;
        drop(sink);
        drop(filter);
        source.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        negotiate_device, CaptureFormat, CaptureRequest, DeviceCapture, DeviceCounters,
        PixelEncoding, RingError, SlotHandle, VirtualDevice, VirtualDeviceSpec,
    };
    use crate::filter::{FilteredFrame, Passthrough};
    use crate::output::write_chunks;
    use std::io;
    use std::sync::Mutex;

    /// Keeps every frame; optionally clears a run flag after `stop_after` frames.
    #[derive(Clone, Default)]
    struct Collect {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        stop_after: Option<(usize, RunFlag)>,
    }

    impl Sink for Collect {
        fn put_frame(&mut self, frame: &mut FilteredFrame<'_>) -> Result<(), SinkError> {
            let mut bytes = Vec::new();
            write_chunks(&mut bytes, frame)?;
            let mut frames = self.frames.lock().unwrap();
            frames.push(bytes);
            if let Some((limit, flag)) = &self.stop_after {
                if frames.len() >= *limit {
                    flag.stop();
                }
            }
            Ok(())
        }
    }

    struct Broken;

    impl Sink for Broken {
        fn put_frame(&mut self, _frame: &mut FilteredFrame<'_>) -> Result<(), SinkError> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe).into())
        }
    }

    fn jpeg_capture(frames: usize) -> (DeviceCapture<VirtualDevice>, DeviceCounters) {
        let device = VirtualDevice::new(VirtualDeviceSpec::new(vec![
            crate::capture::VirtualFormat::new(PixelEncoding::Jpeg, 16, 16),
        ]))
        .with_frames((0..frames).map(|i| vec![i as u8; 10]));
        let counters = device.counters();
        let request = CaptureRequest {
            memory_budget: 1 << 16,
            ..Default::default()
        };
        (negotiate_device(device, "/dev/video0", &request).unwrap(), counters)
    }

    #[test]
    fn test_runs_to_end_of_stream() {
        let (capture, counters) = jpeg_capture(3);
        let sink = Collect::default();
        let frames = sink.frames.clone();

        let report = Session::new(capture, Box::new(Passthrough), Box::new(sink)).run(&RunFlag::new());

        assert_eq!(report.reason, StopReason::EndOfStream);
        assert_eq!(report.stats.frames, 3);
        assert_eq!(report.stats.bytes_out, 30);
        assert_eq!(frames.lock().unwrap()[2], vec![2u8; 10]);

        let state = counters.snapshot();
        assert!(state.closed);
        assert_eq!(state.unmapped, state.mapped);
    }

    #[test]
    fn test_stopped_before_first_frame() {
        let (capture, counters) = jpeg_capture(3);
        let flag = RunFlag::new();
        flag.stop();

        let report = Session::new(capture, Box::new(Passthrough), Box::new(Collect::default())).run(&flag);

        assert_eq!(report.reason, StopReason::Stopped);
        assert_eq!(report.stats.frames, 0);
        assert!(counters.snapshot().closed);
    }

    #[test]
    fn test_stop_is_seen_between_frames() {
        let (capture, _counters) = jpeg_capture(10);
        let flag = RunFlag::new();
        let sink = Collect {
            stop_after: Some((2, flag.clone())),
            ..Default::default()
        };

        let report = Session::new(capture, Box::new(Passthrough), Box::new(sink)).run(&flag);
        assert_eq!(report.reason, StopReason::Stopped);
        assert_eq!(report.stats.frames, 2);
    }

    #[test]
    fn test_sink_failure_ends_session() {
        let (capture, counters) = jpeg_capture(5);

        let report = Session::new(capture, Box::new(Passthrough), Box::new(Broken)).run(&RunFlag::new());

        assert_eq!(report.reason, StopReason::SinkClosed);
        assert_eq!(report.stats.frames, 0);
        let state = counters.snapshot();
        assert_eq!(state.dequeued, 1);
        assert!(state.closed);
    }

    /// Source whose releases are always refused.
    struct Stubborn {
        frames: Vec<Vec<u8>>,
        next: usize,
    }

    impl CaptureSource for Stubborn {
        fn format(&self) -> CaptureFormat {
            CaptureFormat::new(PixelEncoding::Jpeg, 8, 8, 0)
        }

        fn capture_frame(&mut self) -> Result<SlotHandle, RingError> {
            if self.next == self.frames.len() {
                return Err(RingError::Closed);
            }
            self.next += 1;
            Ok(SlotHandle::forge(self.next - 1, self.frames[self.next - 1].len()))
        }

        fn frame(&self, handle: &SlotHandle) -> Result<&[u8], RingError> {
            Ok(&self.frames[handle.index()])
        }

        fn release_frame(&mut self, handle: SlotHandle) -> Result<(), RingError> {
            Err(RingError::NotHeld(handle.index()))
        }

        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_release_faults_are_counted() {
        let source = Stubborn {
            frames: vec![vec![1; 4], vec![2; 4]],
            next: 0,
        };

        let report = Session::new(source, Box::new(Passthrough), Box::new(Collect::default())).run(&RunFlag::new());

        assert_eq!(report.reason, StopReason::EndOfStream);
        assert_eq!(report.stats.frames, 2);
        assert_eq!(report.stats.release_faults, 2);
    }
}
