//! Driver loop statistics

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Frames delivered to the sink
    pub frames: u64,

    /// Bytes handed to the sink
    pub bytes_out: u64,

    /// Frames dropped because the filter failed on them
    pub frames_skipped: u64,

    /// Releases the capture source refused
    pub release_faults: u64,
}

impl PipelineStats {
    /// Frame rate between `previous` and now
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames.saturating_sub(previous.frames);
        frames_delta as f64 / elapsed_secs
    }

    pub fn average_frame_size(&self) -> u64 {
        if self.frames == 0 {
            return 0;
        }
        self.bytes_out / self.frames
    }
}
