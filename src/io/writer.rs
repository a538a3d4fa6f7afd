//! Growable write buffer layered over a controller-opened file.

use std::path::Path;

use crate::error::Result;
use crate::io::controller::{FileController, WritableFile, WriteOptions};

/// Buffered writer used for producing level files. Small writes are staged in
/// a growable in-memory buffer and handed to the underlying [`WritableFile`]
/// in `buffer_size` chunks; writes larger than the buffer bypass it.
pub struct FileWriter {
    file: Box<dyn WritableFile>,
    buf: Vec<u8>,
    buffer_size: usize,
    written: u64,
}

impl FileWriter {
    pub fn create(
        controller: &dyn FileController,
        path: &Path,
        opts: WriteOptions,
        buffer_size: usize,
    ) -> Result<Self> {
        let file = controller.open_write(path, opts)?;
        Ok(Self {
            file,
            buf: Vec::with_capacity(buffer_size.min(64 * 1024)),
            buffer_size: buffer_size.max(1),
            written: 0,
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.written += data.len() as u64;

        if self.buf.len() + data.len() > self.buffer_size {
            self.flush_buf()?;
        }
        if data.len() >= self.buffer_size {
            self.file.write_all(data)?;
        } else {
            self.buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Total bytes accepted so far, including still-buffered bytes.
    pub fn size(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_buf()?;
        self.file.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush_buf()?;
        self.file.sync()
    }

    pub fn close(mut self) -> Result<()> {
        self.flush_buf()?;
        self.file.close()
    }

    fn flush_buf(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}
