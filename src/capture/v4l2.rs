//! V4L2 backend
//!
//! Device control (capabilities, format, frame timing) goes through the `v4l`
//! crate's typed API. Buffer management uses its raw ioctl and mmap layer, so
//! the ring can own the slots and decide when each one is requeued.

use super::device::{
    BufferLayout, DequeuedBuffer, DeviceCaps, DeviceError, DeviceFormat, FrameTiming, VideoDevice,
};
use std::os::raw::{c_int, c_void};
use std::{io, mem, ptr, slice};
use tracing::debug;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::parameters::Capabilities as ParamCaps;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

pub struct V4l2Device {
    path: String,
    device: Device,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        let device = Device::with_path(path).map_err(|e| DeviceError::io("open", e))?;
        debug!(device = %path, "Opened capture device");
        Ok(Self {
            path: path.to_string(),
            device,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn buffer(&self, index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;
        buf
    }

    fn buffer_ioctl(
        &self,
        op: &'static str,
        request: vidioc::_IOC_TYPE,
        buf: &mut v4l2_buffer,
    ) -> Result<(), DeviceError> {
        // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer for the
        // duration of the call
        unsafe { v4l2::ioctl(self.fd(), request, buf as *mut _ as *mut c_void) }
            .map_err(|e| DeviceError::io(op, e))
    }

    fn stream_ioctl(&self, op: &'static str, request: vidioc::_IOC_TYPE) -> Result<(), DeviceError> {
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: the stream ioctls take a pointer to the buffer type
        unsafe { v4l2::ioctl(self.fd(), request, &mut typ as *mut _ as *mut c_void) }
            .map_err(|e| DeviceError::io(op, e))
    }

    /// Waits without timeout until the device is readable.
    fn wait_readable(&self) -> Result<(), DeviceError> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd
            let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
            if ret > 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(DeviceError::io("poll", err));
            }
        }
    }
}

impl VideoDevice for V4l2Device {
    type Memory = MappedBuffer;

    fn capabilities(&self) -> Result<DeviceCaps, DeviceError> {
        let caps = self
            .device
            .query_caps()
            .map_err(|e| DeviceError::io("VIDIOC_QUERYCAP", e))?;

        Ok(DeviceCaps {
            driver: caps.driver.clone(),
            card: caps.card.clone(),
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn format(&self) -> Result<DeviceFormat, DeviceError> {
        let fmt = self
            .device
            .format()
            .map_err(|e| DeviceError::io("VIDIOC_G_FMT", e))?;

        Ok(DeviceFormat {
            fourcc: fmt.fourcc.repr,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            size_image: fmt.size,
        })
    }

    fn set_format(&mut self, fourcc: [u8; 4], width: u32, height: u32) -> Result<(), DeviceError> {
        let fmt = Format::new(width, height, FourCC::new(&fourcc));
        self.device
            .set_format(&fmt)
            .map(|_| ())
            .map_err(|e| DeviceError::io("VIDIOC_S_FMT", e))
    }

    fn frame_timing(&self) -> Result<FrameTiming, DeviceError> {
        let params = self
            .device
            .params()
            .map_err(|e| DeviceError::io("VIDIOC_G_PARM", e))?;

        Ok(FrameTiming {
            adjustable: params.capabilities.contains(ParamCaps::TIME_PER_FRAME),
            numerator: params.interval.numerator,
            denominator: params.interval.denominator,
        })
    }

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<(), DeviceError> {
        let mut params = self
            .device
            .params()
            .map_err(|e| DeviceError::io("VIDIOC_G_PARM", e))?;
        params.interval = Fraction::new(numerator, denominator);

        self.device
            .set_params(&params)
            .map(|_| ())
            .map_err(|e| DeviceError::io("VIDIOC_S_PARM", e))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        // SAFETY: plain C struct
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;

        // SAFETY: `req` is valid for the duration of the call
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )
        }
        .map_err(|e| DeviceError::io("VIDIOC_REQBUFS", e))?;

        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferLayout, DeviceError> {
        let mut buf = self.buffer(index);
        self.buffer_ioctl("VIDIOC_QUERYBUF", vidioc::VIDIOC_QUERYBUF, &mut buf)?;

        Ok(BufferLayout {
            index,
            length: buf.length as usize,
            // SAFETY: MMAP buffers report their offset in this union member
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> Result<MappedBuffer, DeviceError> {
        // SAFETY: maps a region the driver just described for this fd
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                layout.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                layout.offset as libc::off_t,
            )
        }
        .map_err(|e| DeviceError::io("mmap", e))?;

        Ok(MappedBuffer {
            addr: addr as *mut u8,
            len: layout.length,
        })
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        let mut buf = self.buffer(index);
        self.buffer_ioctl("VIDIOC_QBUF", vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, _memory: &mut [MappedBuffer]) -> Result<DequeuedBuffer, DeviceError> {
        let mut buf = self.buffer(0);
        loop {
            self.wait_readable()?;
            match self.buffer_ioctl("VIDIOC_DQBUF", vidioc::VIDIOC_DQBUF, &mut buf) {
                Ok(()) => break,
                Err(DeviceError::Io { source, .. })
                    if matches!(source.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        self.stream_ioctl("VIDIOC_STREAMON", vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        self.stream_ioctl("VIDIOC_STREAMOFF", vidioc::VIDIOC_STREAMOFF)
    }
}

/// A driver buffer mapped into this process. Unmapped on drop.
pub struct MappedBuffer {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain shared memory owned by this value alone
unsafe impl Send for MappedBuffer {}

impl AsRef<[u8]> for MappedBuffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: addr..addr+len stays mapped until drop
        unsafe { slice::from_raw_parts(self.addr, self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region mapped in `map_buffer`
        if let Err(e) = unsafe { v4l2::munmap(self.addr as *mut c_void, self.len) } {
            debug!(error = %e, "munmap failed");
        }
    }
}
