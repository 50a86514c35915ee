use super::{write_chunks, Sink, SinkError};
use crate::filter::FilteredFrame;
use std::io::Write;

/// Writes frames back to back to a byte stream (stdout in practice).
pub struct StreamSink<W: Write> {
    out: W,
}

impl<W: Write> StreamSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Sink for StreamSink<W> {
    fn put_frame(&mut self, frame: &mut FilteredFrame<'_>) -> Result<(), SinkError> {
        write_chunks(&mut self.out, frame)?;
        self.out.flush()?;
        Ok(())
    }
}
