//! The deduplicating extended-attribute store and its on-disk tables.
//!
//! Keys and values are interned separately; a node's attribute set
//! collapses to a sorted list of `(key id, value id)` pairs, and
//! structurally equal sets are hash-consed so they share one xattr index.
//!
//! On disk this becomes two metadata streams (key-value records and
//! per-set id records) plus a header with the id-stream block index.
use bstr::{BStr, BString, ByteSlice};
use indexmap::IndexSet;
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use crate::{
    ErrorInner, Result,
    compress::Compressor,
    file::OutputFile,
    format::{
        self, Flags, SuperBlock, XattrIdEntry, XattrIdTable, XattrKey, XattrValue, inode_ref,
    },
    meta::MetaWriter,
};

#[derive(Debug, Default)]
pub struct XattrTable {
    keys: IndexSet<BString>,
    values: IndexSet<Vec<u8>>,
    sets: IndexSet<Box<[(u32, u32)]>>,
}

impl XattrTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether SquashFS can store a key at all (`user.`, `trusted.` or
    /// `security.` prefix).
    #[must_use]
    pub fn is_representable(key: &BStr) -> bool {
        format::split_xattr_prefix(key).is_some()
    }

    /// Intern one key-value pair and return its `(key id, value id)`.
    pub fn intern_pair(&mut self, key: &BStr, value: &[u8]) -> Result<(u32, u32)> {
        if !Self::is_representable(key) {
            bail!(ErrorInner::Internal("unrepresentable xattr key interned"));
        }
        let (key_id, _) = self.keys.insert_full(key.into());
        let (value_id, _) = self.values.insert_full(value.into());
        Ok((key_id as u32, value_id as u32))
    }

    /// Canonicalize an attribute list and return its xattr index.
    /// Identical sets, in any order, share one index.
    pub fn intern_set(&mut self, mut pairs: Vec<(u32, u32)>) -> Result<u32> {
        if pairs.is_empty() {
            return Ok(format::NO_XATTR);
        }
        pairs.sort_unstable();
        pairs.dedup();
        let (index, _) = self.sets.insert_full(pairs.into_boxed_slice());
        u32::try_from(index)
            .ok()
            .filter(|&i| i < format::NO_XATTR)
            .ok_or_else(|| ErrorInner::Limit("xattr set count exceeds 2^32 - 1").into())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Append the key-value stream, the id stream and the lookup header to
    /// `file`, and point the superblock at them. A no-op for an empty
    /// table.
    pub fn write(&self, file: &mut OutputFile, sb: &mut SuperBlock, cmp: &Compressor) -> Result<()> {
        if self.sets.is_empty() {
            return Ok(());
        }

        let mut kv = MetaWriter::new(cmp.clone());
        let mut id_entries = Vec::with_capacity(self.sets.len());
        for set in &self.sets {
            let (block, offset) = kv.get_position();
            let mut size = 0u32;
            for &(key_id, value_id) in set {
                let key = &self.keys[key_id as usize];
                let value = &self.values[value_id as usize];
                let (prefix, name) = format::split_xattr_prefix(key.as_bstr())
                    .ok_or(ErrorInner::Internal("unrepresentable xattr key interned"))?;
                kv.append(
                    XattrKey {
                        prefix: le::U16::new(prefix),
                        name_size: le::U16::new(name.len() as u16),
                    }
                    .as_bytes(),
                )?;
                kv.append(name)?;
                kv.append(
                    XattrValue {
                        size: le::U32::new(value.len() as u32),
                    }
                    .as_bytes(),
                )?;
                kv.append(value)?;
                size += (size_of::<XattrKey>() + name.len() + size_of::<XattrValue>() + value.len())
                    as u32;
            }
            id_entries.push(XattrIdEntry {
                xattr_ref: le::U64::new(inode_ref(block, offset)),
                count: le::U32::new(set.len() as u32),
                size: le::U32::new(size),
            });
        }

        let kv_start = file.get_size();
        file.append(&kv.into_bytes()?)?;

        let mut ids = MetaWriter::new(cmp.clone());
        ids.append(id_entries.as_slice().as_bytes())?;
        ids.flush()?;
        let id_base = file.get_size();
        let index = ids
            .block_offsets()
            .iter()
            .map(|&off| le::U64::new(id_base + off))
            .collect::<Vec<_>>();
        file.append(&ids.into_bytes()?)?;

        let table_start = file.get_size();
        file.append(
            XattrIdTable {
                kv_start: le::U64::new(kv_start),
                count: le::U32::new(self.sets.len() as u32),
                unused: le::U32::new(0),
            }
            .as_bytes(),
        )?;
        file.append(index.as_slice().as_bytes())?;

        sb.xattr_id_table_start = le::U64::new(table_start);
        sb.clear_flag(Flags::NO_XATTRS);
        Ok(())
    }
}
