//! The random-access output sink.
use std::fs;
use std::path::Path;

use positioned_io::{ReadAt, WriteAt};

use crate::Result;

/// The image file being written.
///
/// Wraps a [`std::fs::File`] with a tracked logical size so the next
/// append offset and the final `bytes_used` are known without querying the
/// OS. All writes go through one owner; [`OutputFile::read_exact_at`] only
/// touches ranges that have already been written (deduplication
/// verification).
#[derive(Debug)]
pub struct OutputFile {
    file: fs::File,
    size: u64,
}

impl OutputFile {
    /// Create the output file.
    ///
    /// Without `overwrite`, an existing file is an error; with it, the
    /// file is truncated.
    pub fn create(path: &Path, overwrite: bool) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .create_new(!overwrite)
            .open(path)?;
        Ok(Self { file, size: 0 })
    }

    /// Wrap an already-open file, e.g. a temporary file in tests.
    pub fn from_file(file: fs::File) -> Result<Self> {
        file.set_len(0)?;
        Ok(Self { file, size: 0 })
    }

    /// The current logical size, which is also the next append offset.
    #[must_use]
    pub fn get_size(&self) -> u64 {
        self.size
    }

    /// Append `buf` at the end of the file and return the offset it was
    /// written at.
    pub fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.file.write_all_at(offset, buf)?;
        self.size += buf.len() as u64;
        Ok(offset)
    }

    /// Overwrite a range that has been written before.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(offset, buf)?;
        self.size = self.size.max(offset + buf.len() as u64);
        Ok(())
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(offset, buf)?;
        Ok(())
    }

    /// Drop everything past `size`.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.size = size;
        Ok(())
    }

    /// Zero-pad the file up to a multiple of `dev_block_size`.
    pub fn pad_to(&mut self, dev_block_size: u32) -> Result<()> {
        let block = u64::from(dev_block_size);
        let tail = self.size % block;
        if tail != 0 {
            self.append(&vec![0u8; (block - tail) as usize])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut f = OutputFile::from_file(tempfile::tempfile().unwrap()).unwrap();
        assert_eq!(f.append(b"hello").unwrap(), 0);
        assert_eq!(f.append(b" world").unwrap(), 5);
        assert_eq!(f.get_size(), 11);

        let mut buf = [0u8; 11];
        f.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");

        f.truncate(5).unwrap();
        assert_eq!(f.get_size(), 5);
        assert_eq!(f.append(b"!").unwrap(), 5);
    }

    #[test]
    fn padding() {
        let mut f = OutputFile::from_file(tempfile::tempfile().unwrap()).unwrap();
        f.append(&[0xAA; 100]).unwrap();
        f.pad_to(1024).unwrap();
        assert_eq!(f.get_size(), 1024);
        // Already aligned, nothing to add.
        f.pad_to(1024).unwrap();
        assert_eq!(f.get_size(), 1024);
    }
}
