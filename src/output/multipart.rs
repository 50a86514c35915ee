//! `multipart/x-mixed-replace` framing, as understood by browsers showing MJPEG

use super::{write_chunks, Sink, SinkError};
use crate::filter::FilteredFrame;
use rand::Rng;
use std::io::Write;
use tracing::debug;

/// Length of the random boundary token.
pub const BOUNDARY_LEN: usize = 32;

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = concat!("webcam-streamer/", env!("CARGO_PKG_VERSION"));

/// Random lowercase alphanumeric boundary.
pub fn boundary_token() -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..BOUNDARY_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Streams frames as parts of one endless HTTP response.
pub struct MultipartSink<W: Write> {
    out: W,
    boundary: String,
    started: bool,
}

impl<W: Write> MultipartSink<W> {
    /// Writes the response head right away.
    pub fn new(out: W) -> Result<Self, SinkError> {
        Self::with_boundary(out, boundary_token())
    }

    pub fn with_boundary(mut out: W, boundary: String) -> Result<Self, SinkError> {
        write!(
            out,
            "HTTP/1.0 200 OK\r\n\
             Connection: close\r\n\
             Server: {}\r\n\
             Pragma: no-cache\r\n\
             Content-type: multipart/x-mixed-replace; boundary={}\r\n\
             \r\n",
            SERVER_NAME, boundary
        )?;
        out.flush()?;
        debug!(%boundary, "Multipart response started");

        Ok(Self {
            out,
            boundary,
            started: false,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Sink for MultipartSink<W> {
    fn put_frame(&mut self, frame: &mut FilteredFrame<'_>) -> Result<(), SinkError> {
        if !self.started {
            write!(self.out, "--{}\r\n", self.boundary)?;
            self.started = true;
        }

        write!(
            self.out,
            "Content-type: image/jpeg\r\nContent-length: {}\r\n\r\n",
            frame.size()
        )?;

        if let Err(e) = write_chunks(&mut self.out, frame) {
            // best effort; the peer is most likely gone already
            let _ = write!(self.out, "\n--{}--\r\n", self.boundary);
            let _ = self.out.flush();
            return Err(e.into());
        }

        write!(self.out, "\n--{}\r\n", self.boundary)?;
        self.out.flush()?;
        Ok(())
    }
}
