use std::path::{Path, PathBuf};

use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::debug;

use crate::MetricSink;

/// Writes TensorBoard event files under `<log_dir>/rank-<rank>`, one directory
/// per worker so concurrent writers never share a file.
pub struct TensorBoardSink {
    writer: SummaryWriter,
    dir: PathBuf,
}

impl TensorBoardSink {
    pub fn new(log_dir: impl AsRef<Path>, rank: usize) -> std::io::Result<Self> {
        let dir = log_dir.as_ref().join(format!("rank-{rank}"));
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opening tensorboard writer");
        Ok(Self {
            writer: SummaryWriter::new(&dir),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for TensorBoardSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorBoardSink")
            .field("dir", &self.dir)
            .finish()
    }
}

impl MetricSink for TensorBoardSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.writer.add_scalar(tag, value as f32, step);
    }

    fn close(&mut self) {
        let _ = self.writer.flush();
    }
}
