//! Metadata block streams.
//!
//! Inodes, directory listings and the lookup tables are stored as a
//! sequence of metadata blocks: up to 8 KiB of payload, compressed when
//! that helps, prefixed with a 16-bit length word whose high bit marks
//! uncompressed storage.
use crate::{ErrorInner, Result, compress::Compressor, format};

/// Writer for one metadata stream.
///
/// The stream accumulates in memory; the caller appends
/// [`MetaWriter::into_bytes`] to the image once the table's start offset
/// is known. Records may straddle block boundaries.
#[derive(Debug)]
pub struct MetaWriter {
    cmp: Compressor,
    buf: Vec<u8>,
    out: Vec<u8>,
    block_offsets: Vec<u64>,
}

impl MetaWriter {
    #[must_use]
    pub fn new(cmp: Compressor) -> Self {
        Self {
            cmp,
            buf: Vec::with_capacity(format::META_BLOCK_SIZE),
            out: Vec::new(),
            block_offsets: Vec::new(),
        }
    }

    /// Buffer `data`, emitting finished 8 KiB blocks as they fill up.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let space = format::META_BLOCK_SIZE - self.buf.len();
            let (chunk, rest) = data.split_at(space.min(data.len()));
            self.buf.extend_from_slice(chunk);
            data = rest;
            if self.buf.len() == format::META_BLOCK_SIZE {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Where the next appended byte will land: the on-disk offset of the
    /// current block relative to the stream start, and the byte offset
    /// inside the uncompressed block.
    #[must_use]
    pub fn get_position(&self) -> (u64, u16) {
        (self.out.len() as u64, self.buf.len() as u16)
    }

    /// Emit the current block even if it is not full. A no-op when the
    /// buffer is empty.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.block_offsets.push(self.out.len() as u64);
        let packed = self.cmp.compress(&self.buf)?;
        let (header, payload): (u16, &[u8]) = match &packed {
            Some(packed) => (packed.len() as u16, packed),
            None => (
                self.buf.len() as u16 | format::META_BLOCK_UNCOMPRESSED,
                &self.buf,
            ),
        };
        self.out.extend_from_slice(&header.to_le_bytes());
        self.out.extend_from_slice(payload);
        self.buf.clear();
        if self.out.len() as u64 > (u64::MAX >> 16) {
            bail!(ErrorInner::Limit("metadata stream exceeds 2^48 bytes"));
        }
        Ok(())
    }

    /// On-disk offsets of all finished blocks, relative to the stream
    /// start. Used to build table indices.
    #[must_use]
    pub fn block_offsets(&self) -> &[u64] {
        &self.block_offsets
    }

    /// Finish the stream and return its on-disk bytes.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        self.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_compressor() -> Compressor {
        Compressor::default_compressor(format::DEFAULT_BLOCK_SIZE)
    }

    #[test]
    fn partial_block() {
        let mut w = MetaWriter::new(test_compressor());
        assert_eq!(w.get_position(), (0, 0));
        w.append(&[1, 2, 3]).unwrap();
        assert_eq!(w.get_position(), (0, 3));

        let out = w.into_bytes().unwrap();
        let word = u16::from_le_bytes([out[0], out[1]]);
        // Three bytes never shrink; stored raw with the high bit set.
        assert_eq!(word, 3 | format::META_BLOCK_UNCOMPRESSED);
        assert_eq!(&out[2..], &[1, 2, 3]);
    }

    #[test]
    fn blocks_split_at_8k() {
        let mut w = MetaWriter::new(test_compressor());
        w.append(&vec![0u8; format::META_BLOCK_SIZE + 10]).unwrap();
        // First block flushed, ten bytes still buffered.
        let (block, offset) = w.get_position();
        assert!(block > 0);
        assert_eq!(offset, 10);
        assert_eq!(w.block_offsets(), &[0]);

        let out = w.into_bytes().unwrap();
        let word = u16::from_le_bytes([out[0], out[1]]);
        // 8 KiB of zeros compresses.
        assert_eq!(word & format::META_BLOCK_UNCOMPRESSED, 0);
        assert_eq!(usize::from(word) + 2, block as usize);
    }

    #[test]
    fn empty_flush_is_noop() {
        let mut w = MetaWriter::new(test_compressor());
        w.flush().unwrap();
        assert!(w.into_bytes().unwrap().is_empty());
    }
}
