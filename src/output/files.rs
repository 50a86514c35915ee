use super::{discard, write_chunks, Sink, SinkError};
use crate::filter::FilteredFrame;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stores every frame as `<dir>/NNNNNNNN.jpg`, numbered from 0.
pub struct FileSink {
    dir: PathBuf,
    next: u32,
}

impl FileSink {
    /// Creates `dir` if needed.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, next: 0 })
    }

    pub fn frames_written(&self) -> u32 {
        self.next
    }

    fn path_for(&self, number: u32) -> PathBuf {
        self.dir.join(format!("{:08}.jpg", number))
    }
}

impl Sink for FileSink {
    fn put_frame(&mut self, frame: &mut FilteredFrame<'_>) -> Result<(), SinkError> {
        if frame.size() == 0 {
            discard(frame);
            return Ok(());
        }

        let path = self.path_for(self.next);
        self.next += 1;

        let file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot create frame file");
                discard(frame);
                return Ok(());
            }
        };

        let mut out = BufWriter::new(file);
        match write_chunks(&mut out, frame).and_then(|n| out.flush().map(|()| n)) {
            Ok(bytes) => info!(path = %path.display(), bytes, "Frame file created"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Writing frame file failed");
                discard(frame);
            }
        }
        Ok(())
    }
}
