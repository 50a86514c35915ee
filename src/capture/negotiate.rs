//! Startup handshake: pixel format, resolution, frame rate and buffer pool

use super::device::{DeviceError, DeviceFormat, VideoDevice};
use super::format::{fourcc_str, CaptureFormat, PixelEncoding, NEGOTIATION_ORDER};
use super::ring::{BufferRing, RingError, MIN_BUFFERS};
use super::v4l2::V4l2Device;
use super::DeviceCapture;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Device nodes tried by auto-scan: `/dev/video0` to `/dev/video15`.
pub const SCAN_CANDIDATES: u32 = 16;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: DeviceError,
    },

    #[error("no usable capture device found")]
    NotFound,

    #[error("querying {what} failed: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("{path} lacks {missing}")]
    MissingCapabilities { path: String, missing: String },

    #[error("no supported pixel format matches {width}x{height}")]
    FormatUnsupported { width: u32, height: u32 },

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("capture stream did not start: {0}")]
    StreamStart(#[source] RingError),
}

/// What the caller wants from the device. Zero means "device default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Explicit device path; `None` scans the candidates in order
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Bytes the buffer pool may take
    pub memory_budget: usize,
    /// Fail negotiation when the stream cannot be started
    pub strict_stream_start: bool,
}

impl CaptureRequest {
    fn accepts(&self, format: &DeviceFormat) -> bool {
        PixelEncoding::from_fourcc(format.fourcc).is_some()
            && (self.width == 0 || self.width == format.width)
            && (self.height == 0 || self.height == format.height)
    }
}

/// Buffers to request for a pool of `budget` bytes: never fewer than two.
pub fn buffer_count(budget: usize, frame_size: usize) -> u32 {
    let fit = budget / frame_size.max(1);
    fit.max(MIN_BUFFERS as usize).min(u32::MAX as usize) as u32
}

/// Negotiates against V4L2 device nodes.
pub fn negotiate(request: &CaptureRequest) -> Result<DeviceCapture<V4l2Device>, NegotiationError> {
    negotiate_with(request, V4l2Device::open)
}

/// Negotiates against devices produced by `open`.
///
/// With an explicit path only that device is tried. Otherwise each candidate
/// is opened in turn; a missing node or a failed negotiation moves on to the
/// next one.
pub fn negotiate_with<D, F>(
    request: &CaptureRequest,
    mut open: F,
) -> Result<DeviceCapture<D>, NegotiationError>
where
    D: VideoDevice,
    F: FnMut(&str) -> Result<D, DeviceError>,
{
    if let Some(path) = &request.device {
        let device = open(path).map_err(|source| NegotiationError::Open {
            path: path.clone(),
            source,
        })?;
        return negotiate_device(device, path, request);
    }

    for index in 0..SCAN_CANDIDATES {
        let path = format!("/dev/video{}", index);
        let device = match open(&path) {
            Ok(device) => device,
            Err(e) if e.is_not_found() => {
                debug!(device = %path, "No such device");
                continue;
            }
            Err(e) => {
                warn!(device = %path, error = %e, "Cannot open device");
                continue;
            }
        };

        match negotiate_device(device, &path, request) {
            Ok(capture) => return Ok(capture),
            Err(e) => warn!(device = %path, error = %e, "Negotiation failed"),
        }
    }

    Err(NegotiationError::NotFound)
}

/// Runs the handshake on an already opened device.
pub fn negotiate_device<D: VideoDevice>(
    mut device: D,
    path: &str,
    request: &CaptureRequest,
) -> Result<DeviceCapture<D>, NegotiationError> {
    let caps = device
        .capabilities()
        .map_err(|source| NegotiationError::Query {
            what: "capabilities",
            source,
        })?;
    debug!(device = %path, driver = %caps.driver, card = %caps.card, "Device capabilities");

    let missing: Vec<&str> = [
        (!caps.video_capture).then_some("video capture"),
        (!caps.streaming).then_some("streaming I/O"),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !missing.is_empty() {
        return Err(NegotiationError::MissingCapabilities {
            path: path.to_string(),
            missing: missing.join(" and "),
        });
    }

    let active = select_format(&mut device, request)?;
    let encoding = PixelEncoding::from_fourcc(active.fourcc).ok_or(
        NegotiationError::FormatUnsupported {
            width: request.width,
            height: request.height,
        },
    )?;
    let format = CaptureFormat::new(encoding, active.width, active.height, active.stride);

    if request.frame_rate > 0 {
        apply_frame_rate(&mut device, request.frame_rate);
    }

    let frame_size = if active.size_image > 0 {
        active.size_image as usize
    } else {
        format.stride.max(format.width * 2) as usize * format.height as usize
    };
    let count = buffer_count(request.memory_budget, frame_size);
    debug!(frame_size, budget = request.memory_budget, count, "Requesting buffers");

    let mut ring = BufferRing::allocate(device, count)?;
    match ring.start() {
        Ok(()) => {}
        Err(e @ RingError::StreamStart(_)) if request.strict_stream_start => {
            ring.shutdown();
            return Err(NegotiationError::StreamStart(e));
        }
        Err(RingError::StreamStart(e)) => {
            warn!(device = %path, error = %e, "Stream start failed, continuing without it");
        }
        Err(e) => return Err(e.into()),
    }

    info!(
        device = %path,
        card = %caps.card,
        format = %format,
        buffers = ring.len(),
        "Capture negotiated"
    );

    Ok(DeviceCapture::new(path, format, ring))
}

fn select_format<D: VideoDevice>(
    device: &mut D,
    request: &CaptureRequest,
) -> Result<DeviceFormat, NegotiationError> {
    let read_back = |device: &D| {
        device.format().map_err(|source| NegotiationError::Query {
            what: "format",
            source,
        })
    };

    let current = read_back(device)?;
    debug!(
        fourcc = %fourcc_str(current.fourcc),
        width = current.width,
        height = current.height,
        "Current device format"
    );
    if request.accepts(&current) {
        return Ok(current);
    }

    let width = if request.width > 0 { request.width } else { current.width };
    let height = if request.height > 0 { request.height } else { current.height };

    for encoding in NEGOTIATION_ORDER {
        if let Err(e) = device.set_format(encoding.fourcc(), width, height) {
            warn!(encoding = %encoding, error = %e, "Setting format failed");
        }
        let active = read_back(device)?;
        if active.fourcc == encoding.fourcc() && request.accepts(&active) {
            return Ok(active);
        }
        debug!(
            wanted = %encoding,
            got = %fourcc_str(active.fourcc),
            width = active.width,
            height = active.height,
            "Format not accepted"
        );
    }

    Err(NegotiationError::FormatUnsupported {
        width: request.width,
        height: request.height,
    })
}

fn apply_frame_rate<D: VideoDevice>(device: &mut D, rate: u32) {
    match device.frame_timing() {
        Ok(timing) if timing.adjustable => {
            if let Err(e) = device.set_frame_interval(1, rate) {
                warn!(rate, error = %e, "Setting frame rate failed");
            } else {
                debug!(rate, "Frame rate set");
            }
        }
        Ok(_) => warn!(rate, "Device frame timing is not adjustable"),
        Err(e) => warn!(rate, error = %e, "Querying frame timing failed"),
    }
}
