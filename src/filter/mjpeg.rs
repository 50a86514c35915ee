//! Motion-JPEG to JPEG
//!
//! Many webcams send MJPEG frames without a DHT segment and rely on the
//! decoder to assume the standard Huffman tables. Stand-alone JPEG decoders do
//! not, so the tables are spliced in right before the scan.

use super::{dht, Filter, FilterError, FilteredFrame};
use tracing::debug;

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_DHT: u8 = 0xC4;

/// Result of scanning the header segments of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    /// No DHT before the scan that starts at this offset
    MissingTables { sos: usize },
    HasTables,
    Unparseable,
}

pub struct MjpegFilter {
    dht: Vec<u8>,
}

impl MjpegFilter {
    pub fn new() -> Self {
        Self {
            dht: dht::standard_segment(),
        }
    }
}

impl Default for MjpegFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for MjpegFilter {
    fn put_frame<'a>(&'a mut self, frame: &'a [u8]) -> Result<FilteredFrame<'a>, FilterError> {
        match scan_header(frame) {
            Header::MissingTables { sos } => {
                Ok(FilteredFrame::from_chunks(&[&frame[..sos], &self.dht[..], &frame[sos..]]))
            }
            Header::HasTables => Ok(FilteredFrame::single(frame)),
            Header::Unparseable => {
                debug!(len = frame.len(), "Frame header not parseable, forwarding as is");
                Ok(FilteredFrame::single(frame))
            }
        }
    }
}

/// Walks marker segments from SOI up to the first SOS.
fn scan_header(frame: &[u8]) -> Header {
    if frame.len() < 4 || frame[0] != 0xFF || frame[1] != MARKER_SOI {
        return Header::Unparseable;
    }

    let mut pos = 2;
    loop {
        if pos >= frame.len() || frame[pos] != 0xFF {
            return Header::Unparseable;
        }
        // fill bytes
        while pos + 1 < frame.len() && frame[pos + 1] == 0xFF {
            pos += 1;
        }
        let Some(&marker) = frame.get(pos + 1) else {
            return Header::Unparseable;
        };

        match marker {
            MARKER_SOS => return Header::MissingTables { sos: pos },
            MARKER_DHT => return Header::HasTables,
            MARKER_EOI => return Header::Unparseable,
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let Some(len) = frame.get(pos + 2..pos + 4) else {
                    return Header::Unparseable;
                };
                let len = usize::from(u16::from_be_bytes([len[0], len[1]]));
                if len < 2 {
                    return Header::Unparseable;
                }
                pos += 2 + len;
            }
        }
    }
}
