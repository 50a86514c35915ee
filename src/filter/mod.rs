//! Frame filters: bring every captured frame to a complete JPEG image
//!
//! A filter is picked once, from the negotiated format, by [`for_format`].

mod dht;
mod mjpeg;
mod passthrough;
mod yuv2jpeg;

pub use mjpeg::MjpegFilter;
pub use passthrough::Passthrough;
pub use yuv2jpeg::YuyvTranscoder;

use crate::capture::{CaptureFormat, PixelEncoding};
use crate::codec::{CodecError, Quality};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("unsupported frame geometry {width}x{height} with stride {stride}")]
    InvalidGeometry { width: u32, height: u32, stride: u32 },

    #[error("compression failed: {0}")]
    Codec(#[from] CodecError),
}

/// Output of one [`Filter::put_frame`] call.
///
/// Holds up to three chunks borrowed from the filter and the input frame.
/// [`read`](Self::read) hands them out once; after the last one every call
/// returns an empty slice and [`size`](Self::size) is 0.
#[derive(Debug)]
pub struct FilteredFrame<'a> {
    chunks: [&'a [u8]; 3],
    count: usize,
    next: usize,
    remaining: usize,
}

impl<'a> FilteredFrame<'a> {
    pub fn empty() -> Self {
        Self::from_chunks(&[])
    }

    pub fn single(bytes: &'a [u8]) -> Self {
        Self::from_chunks(&[bytes])
    }

    /// Builds a frame from at most three chunks; extra chunks are ignored.
    pub fn from_chunks(parts: &[&'a [u8]]) -> Self {
        let none: &'a [u8] = &[];
        let mut chunks = [none; 3];
        let mut count = 0;
        for &part in parts.iter().take(3).filter(|p| !p.is_empty()) {
            chunks[count] = part;
            count += 1;
        }
        let remaining = chunks[..count].iter().map(|c| c.len()).sum();

        Self {
            chunks,
            count,
            next: 0,
            remaining,
        }
    }

    /// Bytes not yet read.
    pub fn size(&self) -> usize {
        self.remaining
    }

    /// Next chunk, or an empty slice once everything has been read.
    pub fn read(&mut self) -> &'a [u8] {
        if self.next >= self.count {
            self.remaining = 0;
            return &[];
        }
        let chunk = self.chunks[self.next];
        self.next += 1;
        self.remaining -= chunk.len();
        chunk
    }

    pub fn is_drained(&self) -> bool {
        self.next >= self.count
    }
}

/// Turns one captured frame into output bytes.
pub trait Filter {
    /// Processes `frame` synchronously; the result borrows both the filter and the frame.
    fn put_frame<'a>(&'a mut self, frame: &'a [u8]) -> Result<FilteredFrame<'a>, FilterError>;
}

/// Picks the filter for a negotiated format.
pub fn for_format(
    format: &CaptureFormat,
    quality: Quality,
) -> Result<Box<dyn Filter + Send>, FilterError> {
    let filter: Box<dyn Filter + Send> = match format.encoding {
        PixelEncoding::Jpeg => Box::new(Passthrough),
        PixelEncoding::Mjpeg => Box::new(MjpegFilter::new()),
        PixelEncoding::Yuyv => Box::new(YuyvTranscoder::new(format, quality)?),
    };
    info!(encoding = %format.encoding, ?quality, "Filter selected");
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_drains_once() {
        let a = [1u8, 2, 3];
        let b = [4u8];
        let parts: [&[u8]; 3] = [&a, &[], &b];
        let mut frame = FilteredFrame::from_chunks(&parts);

        assert_eq!(frame.size(), 4);
        assert_eq!(frame.read(), &a);
        assert_eq!(frame.size(), 1);
        assert_eq!(frame.read(), &b);
        assert!(frame.is_drained());

        for _ in 0..3 {
            assert!(frame.read().is_empty());
            assert_eq!(frame.size(), 0);
        }
    }

    #[test]
    fn test_empty_frame() {
        let mut frame = FilteredFrame::empty();
        assert_eq!(frame.size(), 0);
        assert!(frame.read().is_empty());
    }

    #[test]
    fn test_for_format_rejects_bad_yuyv_geometry() {
        let format = CaptureFormat::new(PixelEncoding::Yuyv, 1, 8, 2);
        assert!(matches!(
            for_format(&format, Quality::EncoderDefault),
            Err(FilterError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_for_format_compressed_needs_no_geometry() {
        let format = CaptureFormat::new(PixelEncoding::Jpeg, 0, 0, 0);
        let mut filter = for_format(&format, Quality::EncoderDefault).unwrap();
        let input = [0xFFu8, 0xD8, 0xFF, 0xD9];
        let mut out = filter.put_frame(&input).unwrap();
        assert_eq!(out.read(), &input);
    }
}
