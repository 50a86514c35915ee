//! Hardware seam shared by negotiation and the buffer ring

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

impl DeviceError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        DeviceError::Io { op, source }
    }

    /// True when the device node does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeviceError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Capability bits the negotiator cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub video_capture: bool,
    pub streaming: bool,
}

/// Active format as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub fourcc: [u8; 4],
    pub width: u32,
    pub height: u32,
    /// Bytes per line, 0 for compressed formats on most drivers
    pub stride: u32,
    /// Bytes needed to hold one frame
    pub size_image: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTiming {
    /// Device accepts a time-per-frame setting
    pub adjustable: bool,
    pub numerator: u32,
    pub denominator: u32,
}

/// Kernel-assigned placement of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub index: u32,
    pub length: usize,
    pub offset: u32,
}

/// A filled buffer handed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: usize,
}

/// A capture device driven through the streaming (mmap) I/O protocol.
///
/// Mapped memory is returned as [`VideoDevice::Memory`]; dropping it unmaps
/// the buffer. Dropping the device closes it.
pub trait VideoDevice {
    type Memory: AsRef<[u8]>;

    fn capabilities(&self) -> Result<DeviceCaps, DeviceError>;

    fn format(&self) -> Result<DeviceFormat, DeviceError>;

    /// Asks for a format. Drivers may adjust it; read back with [`format`](Self::format).
    fn set_format(&mut self, fourcc: [u8; 4], width: u32, height: u32)
        -> Result<(), DeviceError>;

    fn frame_timing(&self) -> Result<FrameTiming, DeviceError>;

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32)
        -> Result<(), DeviceError>;

    /// Requests `count` buffers and returns how many were granted. 0 frees them.
    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError>;

    fn query_buffer(&self, index: u32) -> Result<BufferLayout, DeviceError>;

    fn map_buffer(&self, layout: &BufferLayout) -> Result<Self::Memory, DeviceError>;

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError>;

    /// Blocks until a filled buffer is available.
    ///
    /// `memory` is the full set of mapped buffers, indexed like the kernel slots.
    fn dequeue_buffer(&mut self, memory: &mut [Self::Memory])
        -> Result<DequeuedBuffer, DeviceError>;

    fn stream_on(&mut self) -> Result<(), DeviceError>;

    fn stream_off(&mut self) -> Result<(), DeviceError>;
}
