//! Parallel packing of file contents into data blocks and fragments.
//!
//! Each regular file is split into `block_size` chunks; full chunks become
//! compressed data blocks, a smaller tail is packed together with other
//! tails into shared fragment blocks. Compression runs on worker threads,
//! but bytes reach the image strictly in submission order: the producer
//! thread collects in-order completions from the compression pool and
//! performs every write itself, so offsets are deterministic and
//! deduplication lookups never race a write.
//!
//! Deduplication operates on three levels:
//!
//! - all-zero chunks (including holes expanded from sparse maps) become
//!   zero-size "hole" descriptors and are never stored;
//! - tails are matched against previously packed fragments by content
//!   hash and size;
//! - a file's whole block run is matched against earlier runs when its
//!   last block lands; on a verified byte-for-byte match, the freshly
//!   written run (at that instant the final bytes of the image) is
//!   truncated away and the file points at the older copy.
use std::collections::HashMap;
use std::io::Read;
use std::mem;
use std::num::NonZero;

use xxhash_rust::xxh3::xxh3_64;
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use crate::{
    Error, ErrorInner, Result,
    compress::Compressor,
    file::OutputFile,
    format::{self, Flags, SuperBlock},
    pool::{Block, CompressPool},
    table,
};

/// A data segment of a sparse file; bytes outside all segments are holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseSegment {
    pub offset: u64,
    pub count: u64,
}

/// Handle to a file packed by [`DataWriter::write_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

impl FileId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

const BLOCK_PENDING: u32 = u32::MAX;

/// Packing result of one regular file.
#[derive(Debug, Default)]
pub struct FileData {
    /// Logical file size.
    pub size: u64,
    /// Absolute offset of the first stored block.
    pub blocks_start: u64,
    /// On-disk size per block, in logical order. Zero marks a hole,
    /// [`format::DATA_BLOCK_UNCOMPRESSED`] marks raw storage.
    pub block_sizes: Vec<u32>,
    /// Tail fragment as `(fragment index, byte offset)`, if any.
    pub fragment: Option<(u32, u32)>,
    /// Bytes covered by hole blocks.
    pub sparse_bytes: u64,

    start_set: bool,
    pending: usize,
    complete: bool,
    written_hashes: Vec<u64>,
}

/// Counters reported after packing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub files: u64,
    pub bytes_read: u64,
    pub blocks_written: u64,
    pub fragment_blocks_written: u64,
    pub sparse_bytes: u64,
    pub dedup_bytes: u64,
}

/// Where a completed block's bytes belong.
#[derive(Debug, Clone, Copy)]
enum Target {
    Block { file: usize, size_index: usize },
    Fragment { index: usize },
}

#[derive(Debug, Clone, Copy)]
struct FragEntry {
    start: u64,
    size: u32,
}

#[derive(Debug, Clone, Copy)]
struct RunCandidate {
    start: u64,
    disk_len: u64,
}

/// The accumulated fragment descriptors, returned by
/// [`DataWriter::finish`] and written after the directory table.
#[derive(Debug)]
pub struct FragmentTable {
    entries: Vec<FragEntry>,
}

impl FragmentTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the fragment table and point the superblock at it.
    pub fn write(&self, file: &mut OutputFile, sb: &mut SuperBlock, cmp: &Compressor) -> Result<()> {
        sb.fragment_entry_count = le::U32::new(self.entries.len() as u32);
        if self.entries.is_empty() {
            return Ok(());
        }
        let data = self
            .entries
            .iter()
            .map(|e| format::FragmentEntry {
                start: le::U64::new(e.start),
                size: le::U32::new(e.size),
                unused: le::U32::new(0),
            })
            .collect::<Vec<_>>();
        sb.fragment_table_start =
            le::U64::new(table::write_table(file, cmp, data.as_slice().as_bytes())?);
        sb.clear_flag(Flags::NO_FRAGMENTS);
        sb.set_flag(Flags::ALWAYS_FRAGMENTS);
        Ok(())
    }
}

#[derive(Debug)]
pub struct DataWriter {
    file: OutputFile,
    block_size: u32,

    pool: CompressPool<Target>,
    poisoned: bool,

    files: Vec<FileData>,
    run_dedup: HashMap<u64, Vec<RunCandidate>>,

    frag_buf: Vec<u8>,
    frag_entries: Vec<FragEntry>,
    frag_dedup: HashMap<(u64, u32), (u32, u32)>,

    stats: Stats,
}

impl DataWriter {
    /// Take ownership of the output sink and spawn `num_jobs` compression
    /// workers with an in-flight window of `max_backlog` blocks.
    pub fn new(
        file: OutputFile,
        cmp: Compressor,
        block_size: u32,
        num_jobs: NonZero<usize>,
        max_backlog: NonZero<usize>,
    ) -> Result<Self> {
        Ok(Self {
            file,
            block_size,
            pool: CompressPool::new(&cmp, num_jobs, max_backlog)?,
            poisoned: false,
            files: Vec::new(),
            run_dedup: HashMap::new(),
            frag_buf: Vec::new(),
            frag_entries: Vec::new(),
            frag_dedup: HashMap::new(),
            stats: Stats::default(),
        })
    }

    /// Pack one file's content.
    ///
    /// `size` is the logical size; with a sparse map, `rdr` supplies only
    /// the segments' bytes and everything else reads as zeros. The map
    /// must be validated (monotonic, non-overlapping, within `size`)
    /// before the call.
    pub fn write_file(
        &mut self,
        rdr: &mut dyn Read,
        size: u64,
        sparse: Option<&[SparseSegment]>,
    ) -> Result<FileId> {
        self.check_usable()?;
        let id = self.files.len();
        self.files.push(FileData {
            size,
            ..FileData::default()
        });
        self.stats.files += 1;
        self.stats.bytes_read += size;

        let block_size = u64::from(self.block_size);
        let full_blocks = size / block_size;
        let tail = (size % block_size) as usize;

        let mut src = BlockSource {
            rdr,
            segments: sparse.unwrap_or(&[]),
            expand_holes: sparse.is_some(),
            seg_idx: 0,
            pos: 0,
        };
        let mut buf = vec![0u8; self.block_size as usize];
        for _ in 0..full_blocks {
            src.read_logical(&mut buf)?;
            self.add_block(id, &buf)?;
        }
        self.files[id].complete = true;
        if self.files[id].pending == 0 {
            self.try_dedup_run(id)?;
        }

        if tail > 0 {
            buf.truncate(tail);
            src.read_logical(&mut buf)?;
            self.add_tail(id, &buf)?;
        }
        Ok(FileId(id))
    }

    /// Wait for all in-flight blocks and flush the partial fragment
    /// buffer. Afterwards every byte of the data region is on disk.
    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        self.flush_fragments()?;
        let mut done = Vec::new();
        let drained = self.pool.drain(&mut done);
        self.process_done(done)?;
        drained.map_err(|err| self.fail(err))
    }

    /// Sync and tear down the pool, handing back the sink and the packing
    /// results.
    pub fn finish(mut self) -> Result<(OutputFile, Vec<FileData>, FragmentTable, Stats)> {
        self.sync()?;
        self.pool.close();
        let Self {
            file,
            files,
            frag_entries,
            stats,
            ..
        } = self;
        Ok((
            file,
            files,
            FragmentTable {
                entries: frag_entries,
            },
            stats,
        ))
    }

    /// Whether a previous error latched and poisoned the writer. Errors
    /// surface at the failing call; later calls fail fast.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.poisoned
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            bail!(ErrorInner::Internal("data writer already failed"));
        }
        Ok(())
    }

    fn add_block(&mut self, file: usize, raw: &[u8]) -> Result<()> {
        let f = &mut self.files[file];
        if raw.iter().all(|&b| b == 0) {
            f.block_sizes.push(0);
            f.sparse_bytes += raw.len() as u64;
            self.stats.sparse_bytes += raw.len() as u64;
            return Ok(());
        }

        f.written_hashes.push(xxh3_64(raw));
        let size_index = f.block_sizes.len();
        f.block_sizes.push(BLOCK_PENDING);
        f.pending += 1;
        self.submit(Target::Block { file, size_index }, raw.to_vec())
    }

    fn add_tail(&mut self, file: usize, tail: &[u8]) -> Result<()> {
        let hash = xxh3_64(tail);
        let key = (hash, tail.len() as u32);
        if let Some(&(index, offset)) = self.frag_dedup.get(&key) {
            // Tails still sitting in the open buffer can be verified
            // directly; flushed ones are trusted on hash and size.
            let in_buffer = index as usize == self.frag_entries.len();
            if !in_buffer
                || self.frag_buf[offset as usize..offset as usize + tail.len()] == *tail
            {
                trace!("fragment dedup hit: {} bytes", tail.len());
                self.files[file].fragment = Some((index, offset));
                self.stats.dedup_bytes += tail.len() as u64;
                return Ok(());
            }
        }

        if self.frag_buf.len() + tail.len() > self.block_size as usize {
            self.flush_fragments()?;
        }
        let index = self.frag_entries.len() as u32;
        let offset = self.frag_buf.len() as u32;
        self.frag_buf.extend_from_slice(tail);
        self.frag_dedup.insert(key, (index, offset));
        self.files[file].fragment = Some((index, offset));
        Ok(())
    }

    fn flush_fragments(&mut self) -> Result<()> {
        if self.frag_buf.is_empty() {
            return Ok(());
        }
        if self.frag_entries.len() as u32 >= format::NO_FRAGMENT {
            bail!(ErrorInner::Limit("fragment count exceeds 2^32 - 1"));
        }
        let index = self.frag_entries.len();
        self.frag_entries.push(FragEntry {
            start: 0,
            size: BLOCK_PENDING,
        });
        let data = mem::take(&mut self.frag_buf);
        self.submit(Target::Fragment { index }, data)
    }

    fn submit(&mut self, target: Target, data: Vec<u8>) -> Result<()> {
        let mut done = Vec::new();
        let submitted = self.pool.submit(target, data, &mut done);
        self.process_done(done)?;
        submitted.map_err(|err| self.fail(err))
    }

    /// Handle in-order completions: write each block and account it to
    /// its file or fragment slot.
    fn process_done(&mut self, done: Vec<(Target, Result<Block>)>) -> Result<()> {
        for (target, ret) in done {
            if let Err(err) = ret.and_then(|block| self.emit(target, block)) {
                return Err(self.fail(err));
            }
        }
        Ok(())
    }

    /// Latch a fatal error: later calls fail fast, workers wind down at
    /// their next queue poll.
    fn fail(&mut self, err: Error) -> Error {
        self.poisoned = true;
        self.pool.close();
        err
    }

    fn emit(&mut self, target: Target, block: Block) -> Result<()> {
        let flag = if block.compressed {
            0
        } else {
            format::DATA_BLOCK_UNCOMPRESSED
        };
        match target {
            Target::Block { file, size_index } => {
                let offset = self.file.append(&block.data)?;
                let f = &mut self.files[file];
                if !f.start_set {
                    f.blocks_start = offset;
                    f.start_set = true;
                }
                f.block_sizes[size_index] = block.data.len() as u32 | flag;
                f.pending -= 1;
                self.stats.blocks_written += 1;
                if f.pending == 0 && f.complete {
                    self.try_dedup_run(file)?;
                }
            }
            Target::Fragment { index } => {
                let offset = self.file.append(&block.data)?;
                self.frag_entries[index] = FragEntry {
                    start: offset,
                    size: block.data.len() as u32 | flag,
                };
                self.stats.fragment_blocks_written += 1;
            }
        }
        Ok(())
    }

    /// Match a fully written block run against earlier ones. Called
    /// exactly when the file's last block hit the disk; emission order
    /// guarantees the run is the current tail of the image, so a match
    /// can simply be truncated away.
    fn try_dedup_run(&mut self, file: usize) -> Result<()> {
        let f = &self.files[file];
        if f.written_hashes.is_empty() {
            return Ok(());
        }
        let key = xxh3_64(f.written_hashes.as_slice().as_bytes());
        let start = f.blocks_start;
        let disk_len = self.file.get_size() - start;

        for cand in self.run_dedup.get(&key).map_or(&[][..], Vec::as_slice) {
            if cand.disk_len == disk_len && self.ranges_equal(cand.start, start, disk_len)? {
                trace!("block run dedup hit: {disk_len} bytes at {}", cand.start);
                self.file.truncate(start)?;
                self.files[file].blocks_start = cand.start;
                self.stats.dedup_bytes += disk_len;
                return Ok(());
            }
        }
        self.run_dedup
            .entry(key)
            .or_default()
            .push(RunCandidate { start, disk_len });
        Ok(())
    }

    fn ranges_equal(&self, a: u64, b: u64, len: u64) -> Result<bool> {
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(4096) as usize;
            self.file.read_exact_at(a + done, &mut buf_a[..n])?;
            self.file.read_exact_at(b + done, &mut buf_b[..n])?;
            if buf_a[..n] != buf_b[..n] {
                return Ok(false);
            }
            done += n as u64;
        }
        Ok(true)
    }
}

/// Reads logical file bytes, expanding sparse holes to zeros.
struct BlockSource<'a> {
    rdr: &'a mut dyn Read,
    segments: &'a [SparseSegment],
    expand_holes: bool,
    seg_idx: usize,
    pos: u64,
}

impl BlockSource<'_> {
    fn read_logical(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.expand_holes {
            read_exact_retry(self.rdr, buf)?;
            return Ok(());
        }

        buf.fill(0);
        let window_end = self.pos + buf.len() as u64;
        while let Some(seg) = self.segments.get(self.seg_idx) {
            let seg_end = seg.offset + seg.count;
            if seg.offset >= window_end {
                break;
            }
            // Validation guarantees monotonic segments, so the part of
            // this segment before `pos` was consumed by earlier windows.
            let start = seg.offset.max(self.pos);
            let end = seg_end.min(window_end);
            read_exact_retry(
                self.rdr,
                &mut buf[(start - self.pos) as usize..(end - self.pos) as usize],
            )?;
            if end < seg_end {
                break;
            }
            self.seg_idx += 1;
        }
        self.pos = window_end;
        Ok(())
    }
}

fn read_exact_retry(rdr: &mut dyn Read, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        match rdr.read(buf) {
            Ok(0) => bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "input ended inside a file record",
            )),
            Ok(n) => buf = &mut buf[n..],
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => bail!(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 4096;

    fn writer(jobs: usize) -> DataWriter {
        let file = OutputFile::from_file(tempfile::tempfile().unwrap()).unwrap();
        let cmp = Compressor::default_compressor(BLOCK);
        DataWriter::new(
            file,
            cmp,
            BLOCK,
            NonZero::new(jobs).unwrap(),
            NonZero::new(jobs * 10).unwrap(),
        )
        .unwrap()
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        // Incompressible-ish but deterministic.
        let mut x = u32::from(seed) | 1;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                (x >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn small_files_share_a_fragment_block() {
        let mut w = writer(2);
        let content = b"same one hundred bytes of content ".repeat(3);
        let a = w
            .write_file(&mut &content[..], content.len() as u64, None)
            .unwrap();
        let b = w
            .write_file(&mut &content[..], content.len() as u64, None)
            .unwrap();
        let (_, files, frags, stats) = w.finish().unwrap();

        assert_eq!(frags.len(), 1);
        assert!(files[a.index()].block_sizes.is_empty());
        assert_eq!(files[a.index()].fragment, files[b.index()].fragment);
        assert_eq!(stats.dedup_bytes, content.len() as u64);
    }

    #[test]
    fn identical_files_are_deduplicated() {
        let mut w = writer(2);
        let content = patterned(BLOCK as usize * 3, 5);
        let a = w
            .write_file(&mut &content[..], content.len() as u64, None)
            .unwrap();
        let b = w
            .write_file(&mut &content[..], content.len() as u64, None)
            .unwrap();
        let other = patterned(BLOCK as usize, 9);
        let c = w
            .write_file(&mut &other[..], other.len() as u64, None)
            .unwrap();
        let (file, files, _, _) = w.finish().unwrap();

        assert_eq!(files[a.index()].blocks_start, files[b.index()].blocks_start);
        assert_eq!(files[a.index()].block_sizes, files[b.index()].block_sizes);
        assert_ne!(files[a.index()].blocks_start, files[c.index()].blocks_start);

        // The duplicate was truncated away: c follows a's run directly.
        let a_len = files[a.index()]
            .block_sizes
            .iter()
            .map(|&s| u64::from(s & !format::DATA_BLOCK_UNCOMPRESSED))
            .sum::<u64>();
        assert_eq!(files[c.index()].blocks_start, files[a.index()].blocks_start + a_len);
        assert!(file.get_size() > 0);
    }

    #[test]
    fn sparse_holes_are_elided() {
        let mut w = writer(1);
        // 4 blocks logical, data only in the second block.
        let segments = [SparseSegment {
            offset: u64::from(BLOCK),
            count: u64::from(BLOCK),
        }];
        let payload = patterned(BLOCK as usize, 3);
        let id = w
            .write_file(
                &mut &payload[..],
                u64::from(BLOCK) * 4,
                Some(&segments),
            )
            .unwrap();
        let (file, files, frags, _) = w.finish().unwrap();

        let f = &files[id.index()];
        assert_eq!(f.block_sizes.len(), 4);
        assert_eq!(f.block_sizes[0], 0);
        assert_ne!(f.block_sizes[1], 0);
        assert_eq!(f.block_sizes[2], 0);
        assert_eq!(f.block_sizes[3], 0);
        assert_eq!(f.sparse_bytes, u64::from(BLOCK) * 3);
        assert!(frags.is_empty());

        // Only the data block hit the disk.
        let stored = f.block_sizes[1] & !format::DATA_BLOCK_UNCOMPRESSED;
        assert_eq!(file.get_size(), files[id.index()].blocks_start + u64::from(stored));
    }

    #[test]
    fn zero_tail_packs_like_any_fragment() {
        let mut w = writer(1);
        let content = vec![0u8; 100];
        let id = w.write_file(&mut &content[..], 100, None).unwrap();
        let (_, files, frags, _) = w.finish().unwrap();
        assert_eq!(files[id.index()].fragment, Some((0, 0)));
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn ordering_is_kept_under_parallelism() {
        let mut w = writer(4);
        let mut ids = Vec::new();
        for i in 0..20u8 {
            let content = patterned(BLOCK as usize, i.wrapping_mul(7) | 1);
            ids.push(w.write_file(&mut &content[..], u64::from(BLOCK), None).unwrap());
        }
        let (_, files, _, _) = w.finish().unwrap();
        // Distinct single-block files land in submission order.
        let starts = ids
            .iter()
            .map(|id| files[id.index()].blocks_start)
            .collect::<Vec<_>>();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }
}
