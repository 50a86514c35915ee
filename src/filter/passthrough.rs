use super::{Filter, FilterError, FilteredFrame};

/// Forwards frames unchanged. Used when the device already delivers JPEG.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Filter for Passthrough {
    fn put_frame<'a>(&'a mut self, frame: &'a [u8]) -> Result<FilteredFrame<'a>, FilterError> {
        Ok(FilteredFrame::single(frame))
    }
}
