//! The generic lookup-table writer.
//!
//! The id, fragment and export tables share one on-disk shape: the raw
//! entry array chunked into metadata blocks, followed by an uncompressed
//! index of absolute block offsets. The superblock references the index.
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use crate::{Result, compress::Compressor, file::OutputFile, meta::MetaWriter};

/// Append `data` as a chain of metadata blocks plus their offset index at
/// the current end of `file`, returning the index position.
pub fn write_table(file: &mut OutputFile, cmp: &Compressor, data: &[u8]) -> Result<u64> {
    let mut meta = MetaWriter::new(cmp.clone());
    meta.append(data)?;
    meta.flush()?;

    let base = file.get_size();
    let index = meta
        .block_offsets()
        .iter()
        .map(|&off| le::U64::new(base + off))
        .collect::<Vec<_>>();
    file.append(&meta.into_bytes()?)?;

    let index_start = file.get_size();
    file.append(index.as_slice().as_bytes())?;
    Ok(index_start)
}
