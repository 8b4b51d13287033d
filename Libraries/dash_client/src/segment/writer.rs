use std::fs;
use std::io;
use std::path::Path;

use tracing::trace;

/// Persists downloaded segment bodies.
pub trait SegmentWriter: Send + Sync {
    fn write_segment(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// Writes each segment to its own file, creating parent directories as needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSegmentWriter;

impl SegmentWriter for FileSegmentWriter {
    fn write_segment(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        trace!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}
