//! The uid/gid lookup table.
//!
//! Inodes store 16-bit indices into a dense table of 32-bit ids; every
//! distinct uid and gid of the filesystem is interned exactly once.
use indexmap::IndexSet;
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use crate::{
    ErrorInner, Result, compress::Compressor, file::OutputFile, format::SuperBlock, table,
};

#[derive(Debug, Default)]
pub struct IdTable {
    ids: IndexSet<u32>,
}

impl IdTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `id` and return its table index.
    pub fn id_to_index(&mut self, id: u32) -> Result<u16> {
        let (index, _) = self.ids.insert_full(id);
        u16::try_from(index)
            .map_err(|_| ErrorInner::Limit("more than 65536 distinct uids/gids").into())
    }

    /// Append the table to `file` and point the superblock at it.
    pub fn write(&self, file: &mut OutputFile, sb: &mut SuperBlock, cmp: &Compressor) -> Result<()> {
        let data = self
            .ids
            .iter()
            .map(|&id| le::U32::new(id))
            .collect::<Vec<_>>();
        sb.id_count = le::U16::new(self.ids.len() as u16);
        sb.id_table_start = le::U64::new(table::write_table(file, cmp, data.as_slice().as_bytes())?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut tbl = IdTable::new();
        assert_eq!(tbl.id_to_index(0).unwrap(), 0);
        assert_eq!(tbl.id_to_index(1000).unwrap(), 1);
        assert_eq!(tbl.id_to_index(0).unwrap(), 0);
        assert_eq!(tbl.id_to_index(1000).unwrap(), 1);
        assert_eq!(tbl.id_to_index(7).unwrap(), 2);
    }
}
