//! Fixed pool of memory-mapped capture buffers
//!
//! Every slot is either owned by the hardware (queued, the driver may write
//! into it) or held by the application (dequeued, readable). [`BufferRing::acquire`]
//! moves a slot to the application and hands out a [`SlotHandle`];
//! [`BufferRing::release`] consumes the handle and gives the slot back.

use super::device::{DeviceError, VideoDevice};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fewest buffers a ring will run with.
pub const MIN_BUFFERS: u32 = 2;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("device granted {granted} buffers, need at least 2")]
    InsufficientBuffers { granted: u32 },

    #[error("buffer setup failed: {0}")]
    Setup(#[source] DeviceError),

    #[error("mapping buffer {index} failed: {source}")]
    Map {
        index: u32,
        #[source]
        source: DeviceError,
    },

    #[error("stream start failed: {0}")]
    StreamStart(#[source] DeviceError),

    #[error("acquire failed: {0}")]
    Transport(#[source] DeviceError),

    #[error("device returned slot {0} which is already held")]
    AlreadyHeld(usize),

    #[error("slot {index} out of range (ring has {count} slots)")]
    InvalidSlot { index: usize, count: usize },

    #[error("slot {0} is not held by the application")]
    NotHeld(usize),

    #[error("requeueing slot {index} failed: {source}")]
    Requeue {
        index: usize,
        #[source]
        source: DeviceError,
    },

    #[error("ring is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Mapped, not yet queued
    Idle,
    /// Queued; the driver may write into it
    Hardware,
    /// Dequeued; the application may read it
    Application,
}

/// Proof that a slot is held by the application.
///
/// Not `Clone`: a handle is consumed by exactly one [`BufferRing::release`].
#[derive(Debug)]
#[must_use = "an acquired slot must be released"]
pub struct SlotHandle {
    index: usize,
    bytes_used: usize,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    #[cfg(test)]
    pub(crate) fn forge(index: usize, bytes_used: usize) -> Self {
        Self { index, bytes_used }
    }
}

pub struct BufferRing<D: VideoDevice> {
    device: Option<D>,
    memory: Vec<D::Memory>,
    states: Vec<SlotState>,
    streaming: bool,
}

impl<D: VideoDevice> BufferRing<D> {
    /// Requests `count` buffers and maps all of them.
    ///
    /// Either every granted buffer ends up mapped or none is: a failed mapping
    /// unmaps the earlier ones and frees the kernel buffers.
    pub fn allocate(mut device: D, count: u32) -> Result<Self, RingError> {
        let granted = device.request_buffers(count).map_err(RingError::Setup)?;
        debug!(requested = count, granted, "Buffers granted");

        if granted < MIN_BUFFERS {
            free_kernel_buffers(&mut device);
            return Err(RingError::InsufficientBuffers { granted });
        }

        let mut memory = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mapped = device
                .query_buffer(index)
                .and_then(|layout| {
                    debug!(index, length = layout.length, offset = layout.offset, "Mapping buffer");
                    device.map_buffer(&layout)
                });

            match mapped {
                Ok(m) => memory.push(m),
                Err(source) => {
                    warn!(index, error = %source, "Buffer mapping failed, unmapping {} buffers", memory.len());
                    memory.clear();
                    free_kernel_buffers(&mut device);
                    return Err(RingError::Map { index, source });
                }
            }
        }

        Ok(Self {
            device: Some(device),
            states: vec![SlotState::Idle; memory.len()],
            memory,
            streaming: false,
        })
    }

    /// Queues every slot to the hardware and starts streaming.
    ///
    /// The slots stay queued when only the stream start fails.
    pub fn start(&mut self) -> Result<(), RingError> {
        let device = self.device.as_mut().ok_or(RingError::Closed)?;

        for (index, state) in self.states.iter_mut().enumerate() {
            if *state == SlotState::Idle {
                device
                    .queue_buffer(index as u32)
                    .map_err(RingError::Setup)?;
                *state = SlotState::Hardware;
            }
        }

        device.stream_on().map_err(RingError::StreamStart)?;
        self.streaming = true;
        info!(buffers = self.memory.len(), "Capture stream started");
        Ok(())
    }

    /// Blocks until the hardware hands back a filled slot.
    pub fn acquire(&mut self) -> Result<SlotHandle, RingError> {
        let device = self.device.as_mut().ok_or(RingError::Closed)?;
        let filled = device
            .dequeue_buffer(&mut self.memory)
            .map_err(RingError::Transport)?;

        let index = filled.index as usize;
        match self.states.get(index) {
            Some(SlotState::Hardware) => {}
            Some(_) => return Err(RingError::AlreadyHeld(index)),
            None => {
                return Err(RingError::InvalidSlot {
                    index,
                    count: self.states.len(),
                })
            }
        }

        self.states[index] = SlotState::Application;
        let bytes_used = filled.bytes_used.min(self.memory[index].as_ref().len());
        Ok(SlotHandle { index, bytes_used })
    }

    /// Bytes of a held slot.
    pub fn frame(&self, handle: &SlotHandle) -> Result<&[u8], RingError> {
        self.check_held(handle.index)?;
        Ok(&self.memory[handle.index].as_ref()[..handle.bytes_used])
    }

    /// Gives a held slot back to the hardware.
    ///
    /// A handle that does not name a held slot is logged and rejected without
    /// touching any slot.
    pub fn release(&mut self, handle: SlotHandle) -> Result<(), RingError> {
        if let Err(e) = self.check_held(handle.index) {
            warn!(index = handle.index, error = %e, "Rejected slot release");
            return Err(e);
        }

        let device = self.device.as_mut().ok_or(RingError::Closed)?;
        device
            .queue_buffer(handle.index as u32)
            .map_err(|source| {
                warn!(index = handle.index, error = %source, "Requeue failed");
                RingError::Requeue {
                    index: handle.index,
                    source,
                }
            })?;

        self.states[handle.index] = SlotState::Hardware;
        Ok(())
    }

    /// Stops streaming, unmaps every slot and closes the device.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn shutdown(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };

        if self.streaming {
            if let Err(e) = device.stream_off() {
                warn!(error = %e, "Stream stop failed");
            }
            self.streaming = false;
        }

        let count = self.memory.len();
        self.memory.clear();
        self.states.clear();
        free_kernel_buffers(&mut device);
        drop(device);

        info!(buffers = count, "Capture buffers released");
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Slots currently held by the application.
    pub fn held(&self) -> usize {
        self.states
            .iter()
            .filter(|&&s| s == SlotState::Application)
            .count()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }

    fn check_held(&self, index: usize) -> Result<(), RingError> {
        match self.states.get(index) {
            Some(SlotState::Application) => Ok(()),
            Some(_) => Err(RingError::NotHeld(index)),
            None if self.device.is_none() => Err(RingError::Closed),
            None => Err(RingError::InvalidSlot {
                index,
                count: self.states.len(),
            }),
        }
    }
}

impl<D: VideoDevice> Drop for BufferRing<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn free_kernel_buffers<D: VideoDevice>(device: &mut D) {
    if let Err(e) = device.request_buffers(0) {
        debug!(error = %e, "Freeing kernel buffers failed");
    }
}
