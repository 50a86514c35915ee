//! V4L2 webcam capture with in-process JPEG transcoding
//!
//! Frames flow through a fixed pipeline:
//! - [`capture`] negotiates a device and hands out memory-mapped frames
//! - [`filter`] turns each frame into a complete JPEG (YUYV transcoding,
//!   MJPEG Huffman table insertion, or passthrough)
//! - [`output`] writes it to stdout, numbered files, or a multipart HTTP stream
//! - [`pipeline`] drives one frame at a time until stopped
//!
//! # Example
//!
//! ```no_run
//! use webcam_streamer::{capture, filter, output, pipeline};
//! use webcam_streamer::codec::Quality;
//!
//! # fn main() -> anyhow::Result<()> {
//! let sink = output::open(&output::OutputTarget::Stdout)?;
//! let source = capture::negotiate(&capture::CaptureRequest {
//!     memory_budget: 8 << 20,
//!     ..Default::default()
//! })?;
//! let filter = filter::for_format(&capture::CaptureSource::format(&source), Quality::EncoderDefault)?;
//!
//! let report = pipeline::Session::new(source, filter, sink).run(&pipeline::RunFlag::new());
//! eprintln!("{:?}", report.reason);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod codec;
pub mod config;
pub mod filter;
pub mod output;
pub mod pipeline;

// Re-exports for convenience
pub use capture::{CaptureFormat, CaptureRequest, CaptureSource, DeviceCapture, PixelEncoding};
pub use config::{Config, OutputKind};
pub use filter::{Filter, FilteredFrame};
pub use output::{OutputTarget, Sink};
pub use pipeline::{PipelineStats, RunFlag, Session, SessionReport, StopReason};
