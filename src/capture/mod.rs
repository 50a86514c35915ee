//! Frame capture from streaming video devices

mod device;
mod format;
mod negotiate;
mod ring;
mod v4l2;
#[cfg(any(test, feature = "testing"))]
mod virtual_device;

pub use device::{
    BufferLayout, DequeuedBuffer, DeviceCaps, DeviceError, DeviceFormat, FrameTiming, VideoDevice,
};
pub use format::{fourcc_str, CaptureFormat, PixelEncoding, NEGOTIATION_ORDER};
pub use negotiate::{
    buffer_count, negotiate, negotiate_device, negotiate_with, CaptureRequest, NegotiationError,
    SCAN_CANDIDATES,
};
pub use ring::{BufferRing, RingError, SlotHandle, MIN_BUFFERS};
pub use v4l2::{MappedBuffer, V4l2Device};
#[cfg(any(test, feature = "testing"))]
pub use virtual_device::{
    DeviceCounters, DeviceCounts, VirtualDevice, VirtualDeviceSpec, VirtualFormat, VirtualMemory,
};

use tracing::info;

/// Capture contract consumed by the driver loop.
///
/// A frame obtained with [`capture_frame`](Self::capture_frame) stays readable
/// through [`frame`](Self::frame) until its handle goes back through
/// [`release_frame`](Self::release_frame).
pub trait CaptureSource {
    fn format(&self) -> CaptureFormat;

    /// Blocks until a frame is available. An error means end of stream.
    fn capture_frame(&mut self) -> Result<SlotHandle, RingError>;

    fn frame(&self, handle: &SlotHandle) -> Result<&[u8], RingError>;

    fn release_frame(&mut self, handle: SlotHandle) -> Result<(), RingError>;

    fn shutdown(&mut self);
}

/// A negotiated device together with its buffer ring.
pub struct DeviceCapture<D: VideoDevice> {
    path: String,
    format: CaptureFormat,
    ring: BufferRing<D>,
}

impl<D: VideoDevice> DeviceCapture<D> {
    pub fn new(path: &str, format: CaptureFormat, ring: BufferRing<D>) -> Self {
        Self {
            path: path.to_string(),
            format,
            ring,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ring(&self) -> &BufferRing<D> {
        &self.ring
    }
}

impl<D: VideoDevice> CaptureSource for DeviceCapture<D> {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn capture_frame(&mut self) -> Result<SlotHandle, RingError> {
        self.ring.acquire()
    }

    fn frame(&self, handle: &SlotHandle) -> Result<&[u8], RingError> {
        self.ring.frame(handle)
    }

    fn release_frame(&mut self, handle: SlotHandle) -> Result<(), RingError> {
        self.ring.release(handle)
    }

    fn shutdown(&mut self) {
        if !self.ring.is_closed() {
            info!(device = %self.path, "Closing capture device");
            self.ring.shutdown();
        }
    }
}
