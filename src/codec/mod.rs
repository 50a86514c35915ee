//! JPEG compression of YCbCr rows through mozjpeg
//!
//! Rows go in as interleaved Y, Cb, Cr samples at full width. The encoder is
//! set to 4:2:2 sampling (luma 2x1, each chroma channel 1x1), so chroma is
//! averaged over horizontal pixel pairs: a pair that shares one chroma sample
//! in the source keeps exactly that sample. Output goes to a caller-owned
//! [`OutputBuffer`] so the storage can be reused frame after frame.

mod dest;

pub use dest::{GrowthPolicy, OutputBuffer};

use mozjpeg::{ColorSpace, Compress, CompressStarted};
use std::io;
use thiserror::Error;

/// DCT block edge, and the height of one coding band.
pub const BLOCK_SIZE: usize = 8;

/// Samples per pixel in the rows handed to [`Scan::write_rows`].
pub const COMPONENTS: usize = 3;

/// Quality libjpeg applies when none is set.
pub const DEFAULT_QUALITY: u8 = 75;

/// Largest image edge a JPEG frame header can carry through libjpeg.
const MAX_DIMENSION: u32 = 65_500;

/// (horizontal, vertical) sampling factors of Y, Cb and Cr.
const SAMPLING_422: [(i32, i32); COMPONENTS] = [(2, 1), (1, 1), (1, 1)];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("encoder failed: {0}")]
    Encoder(#[from] io::Error),

    #[error("band shape mismatch: {0}")]
    BandShape(String),

    #[error("all {0} rows already written")]
    TooManyRows(usize),

    #[error("image incomplete: {written} of {expected} rows written")]
    Incomplete { written: usize, expected: usize },
}

/// JPEG quality selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Leave the compressor's own default in place.
    #[default]
    EncoderDefault,
    /// Explicit 0-100 setting.
    Fixed(u8),
}

impl Quality {
    pub fn value(self) -> u8 {
        match self {
            Quality::EncoderDefault => DEFAULT_QUALITY,
            Quality::Fixed(q) => q.min(100),
        }
    }
}

impl From<Option<u8>> for Quality {
    fn from(q: Option<u8>) -> Self {
        q.map_or(Quality::EncoderDefault, Quality::Fixed)
    }
}

/// Compressor settings for a fixed image geometry.
#[derive(Debug, Clone)]
pub struct Compressor {
    width: u32,
    height: u32,
    quality: Quality,
}

impl Compressor {
    pub fn new(width: u32, height: u32, quality: Quality) -> Result<Self, CodecError> {
        let fits = |v: u32| v > 0 && v <= MAX_DIMENSION;
        if !fits(width) || !fits(height) {
            return Err(CodecError::InvalidDimensions { width, height });
        }

        Ok(Self {
            width,
            height,
            quality,
        })
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub fn height(&self) -> usize {
        self.height as usize
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Image height rounded up to whole coding bands.
    pub fn total_rows(&self) -> usize {
        self.height().div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }

    /// Bytes in one interleaved input row.
    pub fn row_len(&self) -> usize {
        self.width() * COMPONENTS
    }

    /// Rewinds `out` and writes the image headers into it.
    pub fn start<'o>(&self, out: &'o mut OutputBuffer) -> Result<Scan<'o>, CodecError> {
        out.begin();

        let mut cinfo = Compress::new(ColorSpace::JCS_YCbCr);
        // baseline, standard Huffman tables
        cinfo.set_fastest_defaults();
        cinfo.set_optimize_coding(false);
        cinfo.set_size(self.width(), self.height());
        if let Quality::Fixed(q) = self.quality {
            cinfo.set_quality(f32::from(q.min(100)));
        }
        for (component, (h, v)) in cinfo.components_mut().iter_mut().zip(SAMPLING_422) {
            component.h_samp_factor = h;
            component.v_samp_factor = v;
        }

        Ok(Scan {
            encoder: cinfo.start_compress(out)?,
            row_len: self.row_len(),
            height: self.height(),
            rows_written: 0,
        })
    }
}

/// One image being compressed; rows go in top to bottom.
pub struct Scan<'o> {
    encoder: CompressStarted<&'o mut OutputBuffer>,
    row_len: usize,
    height: usize,
    rows_written: usize,
}

impl Scan<'_> {
    /// Compresses whole rows; returns how many were taken.
    pub fn write_rows(&mut self, rows: &[u8]) -> Result<usize, CodecError> {
        if rows.len() % self.row_len != 0 {
            return Err(CodecError::BandShape(format!(
                "{} bytes is not a multiple of the {} byte row",
                rows.len(),
                self.row_len
            )));
        }
        let count = rows.len() / self.row_len;
        if self.rows_written + count > self.height {
            return Err(CodecError::TooManyRows(self.height));
        }
        if count == 0 {
            return Ok(0);
        }

        self.encoder.write_scanlines(rows)?;
        self.rows_written += count;
        Ok(count)
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Writes the end of image. Every row must have been written.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.rows_written < self.height {
            return Err(CodecError::Incomplete {
                written: self.rows_written,
                expected: self.height,
            });
        }
        self.encoder.finish()?;
        Ok(())
    }
}
