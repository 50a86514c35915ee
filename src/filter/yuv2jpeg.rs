//! Packed YUV 4:2:2 to JPEG
//!
//! Frames are compressed band by band straight from the capture buffer: each
//! band of [`BLOCK_SIZE`] source rows is unpacked into interleaved Y, Cb, Cr
//! scratch rows and handed to the encoder. No full-frame plane copy is ever
//! made, and the scratch band lives as long as the transcoder.

use super::{Filter, FilterError, FilteredFrame};
use crate::capture::CaptureFormat;
use crate::codec::{Compressor, GrowthPolicy, OutputBuffer, Quality, BLOCK_SIZE, COMPONENTS};
use tracing::{debug, warn};

/// Neutral sample used when a frame has no data at all for a row.
const NEUTRAL: u8 = 128;

pub struct YuyvTranscoder {
    compressor: Compressor,
    output: OutputBuffer,
    band: Band,
    consumed: usize,
}

impl YuyvTranscoder {
    pub fn new(format: &CaptureFormat, quality: Quality) -> Result<Self, FilterError> {
        Self::with_growth(format, quality, GrowthPolicy::default())
    }

    pub fn with_growth(
        format: &CaptureFormat,
        quality: Quality,
        growth: GrowthPolicy,
    ) -> Result<Self, FilterError> {
        if format.width < 2 || format.height == 0 || format.stride < format.width * 2 {
            return Err(FilterError::InvalidGeometry {
                width: format.width,
                height: format.height,
                stride: format.stride,
            });
        }

        let compressor = Compressor::new(format.width, format.height, quality)?;
        debug!(
            width = format.width,
            height = format.height,
            stride = format.stride,
            coding_rows = compressor.total_rows(),
            "YUYV transcoder ready"
        );

        Ok(Self {
            band: Band::new(format.width as usize, format.stride as usize),
            compressor,
            output: OutputBuffer::new(growth),
            consumed: 0,
        })
    }

    /// Source bytes read for the last frame.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Current size of the output storage.
    pub fn output_capacity(&self) -> usize {
        self.output.capacity()
    }

    fn compress(&mut self, frame: &[u8]) -> Result<(), FilterError> {
        let image_rows = self.compressor.height();
        let mut short_rows = 0;

        let mut scan = self.compressor.start(&mut self.output)?;
        for band_start in (0..image_rows).step_by(BLOCK_SIZE) {
            let rows = BLOCK_SIZE.min(image_rows - band_start);
            for slot in 0..rows {
                if !self.band.unpack_row(frame, band_start + slot, slot) {
                    short_rows += 1;
                }
            }
            scan.write_rows(self.band.rows(rows))?;
        }
        scan.finish()?;

        // the last band spans the padded coding rows
        self.consumed = frame
            .len()
            .min(self.compressor.total_rows() * self.band.stride);
        if short_rows > 0 {
            warn!(
                frame_len = frame.len(),
                missing_rows = short_rows,
                "Short YUYV frame, repeating last row"
            );
        }
        Ok(())
    }
}

/// Scratch rows for one coding band, interleaved Y, Cb, Cr per pixel.
struct Band {
    width: usize,
    stride: usize,
    row_len: usize,
    samples: Vec<u8>,
}

impl Band {
    fn new(width: usize, stride: usize) -> Self {
        let row_len = width * COMPONENTS;
        Self {
            width,
            stride,
            row_len,
            samples: vec![NEUTRAL; row_len * BLOCK_SIZE],
        }
    }

    fn rows(&self, count: usize) -> &[u8] {
        &self.samples[..count * self.row_len]
    }

    /// Unpacks one source row into the scratch row at `slot`.
    ///
    /// Returns false when the frame does not hold that row; the slot is then
    /// filled from the row above it.
    fn unpack_row(&mut self, frame: &[u8], source_row: usize, slot: usize) -> bool {
        let pairs = self.width / 2;
        let start = source_row * self.stride;

        let Some(packed) = frame.get(start..start + pairs * 4) else {
            self.repeat_previous_row(slot, source_row == 0);
            return false;
        };

        let row = &mut self.samples[slot * self.row_len..(slot + 1) * self.row_len];
        for (px, out) in packed.chunks_exact(4).zip(row.chunks_exact_mut(2 * COMPONENTS)) {
            let (y0, cb, y1, cr) = (px[0], px[1], px[2], px[3]);
            out.copy_from_slice(&[y0, cb, cr, y1, cb, cr]);
        }

        // odd width: the last pixel has no pair of its own
        if self.width % 2 == 1 {
            let last = pairs * 2 * COMPONENTS;
            row.copy_within(last - COMPONENTS..last, last);
        }
        true
    }

    fn repeat_previous_row(&mut self, slot: usize, first_row: bool) {
        let row_len = self.row_len;
        if first_row {
            self.samples[slot * row_len..(slot + 1) * row_len].fill(NEUTRAL);
            return;
        }
        // slot 0 repeats the last row of the previous band, still in the scratch
        let previous = (slot + BLOCK_SIZE - 1) % BLOCK_SIZE;
        self.samples
            .copy_within(previous * row_len..(previous + 1) * row_len, slot * row_len);
    }
}

impl Filter for YuyvTranscoder {
    fn put_frame<'a>(&'a mut self, frame: &'a [u8]) -> Result<FilteredFrame<'a>, FilterError> {
        self.compress(frame)?;
        Ok(FilteredFrame::single(self.output.as_slice()))
    }
}
