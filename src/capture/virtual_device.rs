//! Scripted in-memory capture device
//!
//! Behaves like a streaming V4L2 node as far as the negotiator and the ring
//! can tell: it has a capability set, a list of formats it will accept, a
//! buffer limit, and a queue of frames it hands out one per dequeue. Failures
//! can be injected at the mapping and stream-start steps. Everything it does
//! is counted in a shared [`DeviceCounters`].

use super::device::{
    BufferLayout, DequeuedBuffer, DeviceCaps, DeviceError, DeviceFormat, FrameTiming, VideoDevice,
};
use super::format::PixelEncoding;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

/// One format the virtual device accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualFormat {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    /// Extra bytes at the end of each packed row
    pub padding: u32,
}

impl VirtualFormat {
    pub fn new(encoding: PixelEncoding, width: u32, height: u32) -> Self {
        Self {
            encoding,
            width,
            height,
            padding: 0,
        }
    }

    fn device_format(&self) -> DeviceFormat {
        let stride = match self.encoding {
            PixelEncoding::Yuyv => self.width * 2 + self.padding,
            PixelEncoding::Jpeg | PixelEncoding::Mjpeg => 0,
        };
        let size_image = match self.encoding {
            PixelEncoding::Yuyv => stride * self.height,
            PixelEncoding::Jpeg | PixelEncoding::Mjpeg => self.width * self.height * 2,
        };

        DeviceFormat {
            fourcc: self.encoding.fourcc(),
            width: self.width,
            height: self.height,
            stride,
            size_image,
        }
    }
}

/// Script for a [`VirtualDevice`].
#[derive(Debug, Clone)]
pub struct VirtualDeviceSpec {
    pub card: String,
    pub video_capture: bool,
    pub streaming: bool,
    /// Accepted formats; the first one is active when the device opens
    pub formats: Vec<VirtualFormat>,
    pub adjustable_timing: bool,
    pub max_buffers: u32,
    /// Mapping the buffer with this index fails
    pub fail_map_at: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_set_format: bool,
}

impl VirtualDeviceSpec {
    pub fn new(formats: Vec<VirtualFormat>) -> Self {
        Self {
            card: "Virtual Camera".to_string(),
            video_capture: true,
            streaming: true,
            formats,
            adjustable_timing: true,
            max_buffers: 32,
            fail_map_at: None,
            fail_stream_on: false,
            fail_set_format: false,
        }
    }

    pub fn yuyv(width: u32, height: u32) -> Self {
        Self::new(vec![VirtualFormat::new(PixelEncoding::Yuyv, width, height)])
    }

    pub fn mjpeg(width: u32, height: u32) -> Self {
        Self::new(vec![VirtualFormat::new(PixelEncoding::Mjpeg, width, height)])
    }
}

/// Counters describing what has been done to a [`VirtualDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    /// Non-zero buffer requests
    pub request_calls: usize,
    /// Buffers currently allocated
    pub buffers_granted: u32,
    pub mapped: usize,
    pub unmapped: usize,
    pub queued: usize,
    pub dequeued: usize,
    pub format_sets: usize,
    pub frame_interval: Option<(u32, u32)>,
    pub streaming: bool,
    pub stream_on_calls: usize,
    pub stream_off_calls: usize,
    pub closed: bool,
}

/// Shared view of a [`VirtualDevice`]'s counters; outlives the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCounters(Arc<Mutex<DeviceCounts>>);

impl DeviceCounters {
    pub fn snapshot(&self) -> DeviceCounts {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut DeviceCounts)) {
        f(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Memory of one virtual buffer. Counts as unmapped when dropped.
#[derive(Debug)]
pub struct VirtualMemory {
    data: Vec<u8>,
    counters: DeviceCounters,
}

impl AsRef<[u8]> for VirtualMemory {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        self.counters.update(|s| s.unmapped += 1);
    }
}

pub struct VirtualDevice {
    spec: VirtualDeviceSpec,
    active: Option<VirtualFormat>,
    interval: (u32, u32),
    granted: u32,
    queue: VecDeque<u32>,
    frames: VecDeque<Vec<u8>>,
    streaming: bool,
    counters: DeviceCounters,
}

impl VirtualDevice {
    pub fn new(spec: VirtualDeviceSpec) -> Self {
        Self {
            active: spec.formats.first().copied(),
            spec,
            interval: (1, 30),
            granted: 0,
            queue: VecDeque::new(),
            frames: VecDeque::new(),
            streaming: false,
            counters: DeviceCounters::default(),
        }
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters.clone()
    }

    /// Appends a frame to deliver. Frames larger than a buffer are truncated.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    pub fn with_frames(mut self, frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.frames.extend(frames);
        self
    }

    fn check_index(&self, index: u32) -> Result<(), DeviceError> {
        if index < self.granted {
            Ok(())
        } else {
            Err(DeviceError::io(
                "buffer index",
                io::Error::from_raw_os_error(libc::EINVAL),
            ))
        }
    }
}

impl VideoDevice for VirtualDevice {
    type Memory = VirtualMemory;

    fn capabilities(&self) -> Result<DeviceCaps, DeviceError> {
        Ok(DeviceCaps {
            driver: "virtual".to_string(),
            card: self.spec.card.clone(),
            video_capture: self.spec.video_capture,
            streaming: self.spec.streaming,
        })
    }

    fn format(&self) -> Result<DeviceFormat, DeviceError> {
        self.active
            .map(|f| f.device_format())
            .ok_or_else(|| DeviceError::Rejected("device has no formats".to_string()))
    }

    fn set_format(&mut self, fourcc: [u8; 4], width: u32, height: u32) -> Result<(), DeviceError> {
        self.counters.update(|s| s.format_sets += 1);
        if self.spec.fail_set_format {
            return Err(DeviceError::io(
                "set format",
                io::Error::from_raw_os_error(libc::EBUSY),
            ));
        }

        // Like a driver: pick the closest supported mode, keep the old one if
        // the encoding is unknown.
        let Some(encoding) = PixelEncoding::from_fourcc(fourcc) else {
            return Ok(());
        };
        let mut candidates = self.spec.formats.iter().filter(|f| f.encoding == encoding);
        let exact = candidates
            .clone()
            .find(|f| f.width == width && f.height == height);
        if let Some(format) = exact.or_else(|| candidates.next()) {
            self.active = Some(*format);
        }
        Ok(())
    }

    fn frame_timing(&self) -> Result<FrameTiming, DeviceError> {
        Ok(FrameTiming {
            adjustable: self.spec.adjustable_timing,
            numerator: self.interval.0,
            denominator: self.interval.1,
        })
    }

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<(), DeviceError> {
        if !self.spec.adjustable_timing {
            return Err(DeviceError::Rejected(
                "frame interval is fixed".to_string(),
            ));
        }
        self.interval = (numerator, denominator);
        self.counters
            .update(|s| s.frame_interval = Some((numerator, denominator)));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        self.granted = count.min(self.spec.max_buffers);
        self.queue.clear();

        let granted = self.granted;
        self.counters.update(|s| {
            if count > 0 {
                s.request_calls += 1;
            }
            s.buffers_granted = granted;
        });
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferLayout, DeviceError> {
        self.check_index(index)?;
        let length = self.format()?.size_image as usize;
        Ok(BufferLayout {
            index,
            length,
            offset: index * length as u32,
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> Result<VirtualMemory, DeviceError> {
        if self.spec.fail_map_at == Some(layout.index) {
            return Err(DeviceError::io(
                "mmap",
                io::Error::from_raw_os_error(libc::ENOMEM),
            ));
        }
        self.counters.update(|s| s.mapped += 1);
        Ok(VirtualMemory {
            data: vec![0; layout.length],
            counters: self.counters.clone(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        self.check_index(index)?;
        if self.queue.contains(&index) {
            return Err(DeviceError::Rejected(format!(
                "buffer {} is already queued",
                index
            )));
        }
        self.queue.push_back(index);
        self.counters.update(|s| s.queued += 1);
        Ok(())
    }

    fn dequeue_buffer(&mut self, memory: &mut [VirtualMemory]) -> Result<DequeuedBuffer, DeviceError> {
        if !self.streaming {
            return Err(DeviceError::io(
                "dequeue",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        if self.frames.is_empty() {
            return Err(DeviceError::io(
                "dequeue",
                io::Error::from_raw_os_error(libc::ENODEV),
            ));
        }
        let index = self.queue.pop_front().ok_or_else(|| {
            DeviceError::Rejected("no buffer queued".to_string())
        })?;
        let frame = self.frames.pop_front().unwrap_or_default();

        let slot = memory.get_mut(index as usize).ok_or_else(|| {
            DeviceError::Rejected(format!("buffer {} is not mapped", index))
        })?;
        let bytes_used = frame.len().min(slot.data.len());
        slot.data[..bytes_used].copy_from_slice(&frame[..bytes_used]);

        self.counters.update(|s| s.dequeued += 1);
        Ok(DequeuedBuffer { index, bytes_used })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        self.counters.update(|s| s.stream_on_calls += 1);
        if self.spec.fail_stream_on {
            return Err(DeviceError::io(
                "stream on",
                io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        self.streaming = true;
        self.counters.update(|s| s.streaming = true);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        self.streaming = false;
        self.queue.clear();
        self.counters.update(|s| {
            s.streaming = false;
            s.stream_off_calls += 1;
        });
        Ok(())
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.counters.update(|s| s.closed = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_with_first_format() {
        let device = VirtualDevice::new(VirtualDeviceSpec::yuyv(640, 480));
        let format = device.format().unwrap();
        assert_eq!(&format.fourcc, b"YUYV");
        assert_eq!(format.stride, 1280);
        assert_eq!(format.size_image, 1280 * 480);
    }

    #[test]
    fn test_set_format_picks_supported_mode() {
        let mut device = VirtualDevice::new(VirtualDeviceSpec::new(vec![
            VirtualFormat::new(PixelEncoding::Yuyv, 320, 240),
            VirtualFormat::new(PixelEncoding::Yuyv, 640, 480),
            VirtualFormat::new(PixelEncoding::Mjpeg, 1280, 720),
        ]));

        device.set_format(*b"YUYV", 640, 480).unwrap();
        assert_eq!(device.format().unwrap().width, 640);

        // unsupported size: driver falls back to the first mode of that encoding
        device.set_format(*b"MJPG", 800, 600).unwrap();
        let format = device.format().unwrap();
        assert_eq!((&format.fourcc, format.width), (b"MJPG", 1280));

        // an encoding the device lacks leaves the format alone
        device.set_format(*b"JPEG", 640, 480).unwrap();
        assert_eq!(&device.format().unwrap().fourcc, b"MJPG");
        assert_eq!(device.counters().snapshot().format_sets, 3);
    }

    #[test]
    fn test_buffer_limit() {
        let mut spec = VirtualDeviceSpec::yuyv(16, 8);
        spec.max_buffers = 3;
        let mut device = VirtualDevice::new(spec);

        assert_eq!(device.request_buffers(10).unwrap(), 3);
        assert!(device.query_buffer(2).is_ok());
        assert!(device.query_buffer(3).is_err());
    }

    #[test]
    fn test_dequeue_fifo_and_truncation() {
        let mut device = VirtualDevice::new(VirtualDeviceSpec::yuyv(4, 1))
            .with_frames([vec![1; 8], vec![2; 100]]);
        device.request_buffers(2).unwrap();
        let mut memory = vec![
            device.map_buffer(&device.query_buffer(0).unwrap()).unwrap(),
            device.map_buffer(&device.query_buffer(1).unwrap()).unwrap(),
        ];
        device.queue_buffer(1).unwrap();
        device.queue_buffer(0).unwrap();
        assert!(device.queue_buffer(0).is_err());
        device.stream_on().unwrap();

        let first = device.dequeue_buffer(&mut memory).unwrap();
        assert_eq!(first, DequeuedBuffer { index: 1, bytes_used: 8 });
        let second = device.dequeue_buffer(&mut memory).unwrap();
        assert_eq!(second, DequeuedBuffer { index: 0, bytes_used: 8 });
        assert_eq!(memory[0].as_ref(), &[2; 8]);

        // script exhausted
        assert!(device.dequeue_buffer(&mut memory).is_err());
    }

    #[test]
    fn test_counters_outlive_device() {
        let device = VirtualDevice::new(VirtualDeviceSpec::mjpeg(16, 16));
        let counters = device.counters();
        drop(device);
        assert!(counters.snapshot().closed);
    }

    #[test]
    fn test_fixed_timing_rejects_interval() {
        let mut spec = VirtualDeviceSpec::yuyv(16, 8);
        spec.adjustable_timing = false;
        let mut device = VirtualDevice::new(spec);

        assert!(!device.frame_timing().unwrap().adjustable);
        assert!(device.set_frame_interval(1, 15).is_err());
        assert_eq!(device.counters().snapshot().frame_interval, None);
    }
}
