//! Negotiated capture format

use std::fmt;

/// Pixel encodings the pipeline can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// Packed YUV 4:2:2, byte order Y0 U Y1 V
    Yuyv,
    /// Complete JPEG images
    Jpeg,
    /// Motion-JPEG frames, usually without a DHT segment
    Mjpeg,
}

/// Order in which encodings are tried when the current device format is not usable.
pub const NEGOTIATION_ORDER: [PixelEncoding; 3] =
    [PixelEncoding::Jpeg, PixelEncoding::Mjpeg, PixelEncoding::Yuyv];

impl PixelEncoding {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelEncoding::Yuyv => *b"YUYV",
            PixelEncoding::Jpeg => *b"JPEG",
            PixelEncoding::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"YUYV" => Some(PixelEncoding::Yuyv),
            b"JPEG" => Some(PixelEncoding::Jpeg),
            b"MJPG" => Some(PixelEncoding::Mjpeg),
            _ => None,
        }
    }

    /// Bytes per pixel for packed formats, 0 for compressed ones.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelEncoding::Yuyv => 2,
            PixelEncoding::Jpeg | PixelEncoding::Mjpeg => 0,
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fourcc_str(self.fourcc()))
    }
}

/// Renders a FourCC for log output; non-printable bytes become `.`.
pub fn fourcc_str(fourcc: [u8; 4]) -> String {
    fourcc
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}

/// Capture format fixed by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    /// Bytes per source row, padding included
    pub stride: u32,
}

impl CaptureFormat {
    /// Builds a format, widening `stride` to at least one packed row.
    pub fn new(encoding: PixelEncoding, width: u32, height: u32, stride: u32) -> Self {
        let min_stride = width.saturating_mul(encoding.bytes_per_pixel());
        Self {
            encoding,
            width,
            height,
            stride: stride.max(min_stride),
        }
    }

    /// Padding bytes at the end of each packed row.
    pub fn row_padding(&self) -> u32 {
        self.stride
            .saturating_sub(self.width * self.encoding.bytes_per_pixel())
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} stride {}",
            self.encoding, self.width, self.height, self.stride
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        for encoding in NEGOTIATION_ORDER {
            assert_eq!(PixelEncoding::from_fourcc(encoding.fourcc()), Some(encoding));
        }
        assert_eq!(PixelEncoding::from_fourcc(*b"RGB3"), None);
    }

    #[test]
    fn test_negotiation_order() {
        assert_eq!(
            NEGOTIATION_ORDER,
            [PixelEncoding::Jpeg, PixelEncoding::Mjpeg, PixelEncoding::Yuyv]
        );
    }

    #[test]
    fn test_stride_never_below_row() {
        let format = CaptureFormat::new(PixelEncoding::Yuyv, 640, 480, 0);
        assert_eq!(format.stride, 1280);
        assert_eq!(format.row_padding(), 0);

        let padded = CaptureFormat::new(PixelEncoding::Yuyv, 640, 480, 1344);
        assert_eq!(padded.row_padding(), 64);
    }

    #[test]
    fn test_display() {
        let format = CaptureFormat::new(PixelEncoding::Mjpeg, 320, 240, 0);
        assert_eq!(format.to_string(), "MJPG 320x240 stride 0");
        assert_eq!(fourcc_str([b'Y', 0, b'U', 0xFF]), "Y.U.");
    }
}
