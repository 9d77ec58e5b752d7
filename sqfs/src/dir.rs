//! The directory-table writer.
//!
//! A directory's listing is a sequence of runs: a [`DirHeader`] followed
//! by up to 256 entries that share the metadata block of their inodes and
//! whose inode numbers stay within a 16-bit delta of the header's base.
use bstr::{BStr, BString};
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use crate::{
    ErrorInner, Result,
    compress::Compressor,
    format::{DirEntry, DirHeader, DirIndex, InodeType},
    meta::MetaWriter,
};

const MAX_RUN_ENTRIES: usize = 256;
/// Linux rejects names longer than this in one entry.
const MAX_NAME_LEN: usize = 255;

#[derive(Debug)]
struct PendingEntry {
    name: BString,
    inode_num: u32,
    inode_ref: u64,
    inode_type: InodeType,
}

/// A finished listing, everything the directory's own inode needs.
#[derive(Debug)]
pub struct Listing {
    /// Metadata block holding the listing start, relative to the
    /// directory table.
    pub block: u32,
    /// Offset of the listing inside that block.
    pub offset: u16,
    /// Uncompressed byte size of the listing (the inode stores this
    /// plus 3).
    pub size: u32,
    /// Fast-lookup index records for extended directory inodes, one per
    /// additional metadata block the listing spills into.
    pub index: Vec<(DirIndex, BString)>,
}

/// Writes directory listings into the directory metadata stream.
#[derive(Debug)]
pub struct DirWriter {
    dm: MetaWriter,
    entries: Vec<PendingEntry>,
}

impl DirWriter {
    #[must_use]
    pub fn new(cmp: Compressor) -> Self {
        Self {
            dm: MetaWriter::new(cmp),
            entries: Vec::new(),
        }
    }

    /// Start collecting the entries of one directory.
    pub fn begin(&mut self) {
        self.entries.clear();
    }

    /// Queue one child. Children must be added in sorted order; the
    /// serializer sorts the tree beforehand.
    pub fn add_entry(
        &mut self,
        name: &BStr,
        inode_num: u32,
        inode_ref: u64,
        mode: u32,
    ) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            bail!(ErrorInner::Limit("directory entry name exceeds 255 bytes"));
        }
        let inode_type = InodeType::basic_of_mode(mode)
            .ok_or(ErrorInner::Internal("node without a file type"))?;
        self.entries.push(PendingEntry {
            name: name.into(),
            inode_num,
            inode_ref,
            inode_type,
        });
        Ok(())
    }

    /// Write the queued entries as runs and return the listing
    /// description.
    pub fn end(&mut self) -> Result<Listing> {
        let (block, offset) = self.dm.get_position();
        let block = u32::try_from(block)
            .map_err(|_| ErrorInner::Limit("directory table exceeds 4 GiB"))?;
        let mut index = Vec::new();
        let mut size = 0u64;

        let mut i = 0;
        while i < self.entries.len() {
            let base = &self.entries[i];
            let base_block = base.inode_ref >> 16;
            let base_num = base.inode_num;

            let mut count = 1;
            while count < MAX_RUN_ENTRIES && i + count < self.entries.len() {
                let ent = &self.entries[i + count];
                let diff = i64::from(ent.inode_num) - i64::from(base_num);
                if ent.inode_ref >> 16 != base_block || i16::try_from(diff).is_err() {
                    break;
                }
                count += 1;
            }

            let (header_block, _) = self.dm.get_position();
            if header_block != u64::from(block) {
                let header_block = u32::try_from(header_block)
                    .map_err(|_| ErrorInner::Limit("directory table exceeds 4 GiB"))?;
                let listing_offset = u32::try_from(size)
                    .map_err(|_| ErrorInner::Limit("directory listing exceeds 4 GiB"))?;
                let latest = index.last().map(|(idx, _): &(DirIndex, BString)| idx.start.get());
                if latest != Some(header_block) {
                    index.push((
                        DirIndex {
                            index: le::U32::new(listing_offset),
                            start: le::U32::new(header_block),
                            name_size: le::U32::new(base.name.len() as u32 - 1),
                        },
                        base.name.clone(),
                    ));
                }
            }

            let base_block = u32::try_from(base_block)
                .map_err(|_| ErrorInner::Limit("inode table exceeds 4 GiB"))?;
            self.dm.append(
                DirHeader {
                    count: le::U32::new(count as u32 - 1),
                    start: le::U32::new(base_block),
                    inode_number: le::U32::new(base_num),
                }
                .as_bytes(),
            )?;
            size += size_of::<DirHeader>() as u64;

            for ent in &self.entries[i..i + count] {
                self.dm.append(
                    DirEntry {
                        offset: le::U16::new((ent.inode_ref & 0xFFFF) as u16),
                        inode_diff: le::I16::new(
                            (i64::from(ent.inode_num) - i64::from(base_num)) as i16,
                        ),
                        inode_type: le::U16::new(ent.inode_type.0.get()),
                        name_size: le::U16::new(ent.name.len() as u16 - 1),
                    }
                    .as_bytes(),
                )?;
                self.dm.append(&ent.name)?;
                size += (size_of::<DirEntry>() + ent.name.len()) as u64;
            }
            i += count;
        }

        self.entries.clear();
        let size = u32::try_from(size)
            .ok()
            .filter(|&s| s <= u32::MAX - 3)
            .ok_or(ErrorInner::Limit("directory listing exceeds 4 GiB"))?;
        if index.len() > usize::from(u16::MAX) {
            bail!(ErrorInner::Limit("directory index exceeds 65535 entries"));
        }
        Ok(Listing {
            block,
            offset,
            size,
            index,
        })
    }

    /// Finish the directory metadata stream and return its on-disk bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        self.dm.into_bytes()
    }
}
