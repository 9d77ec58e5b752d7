//! The tar-record decoder.
//!
//! [`TarReader::read_header`] consumes one logical entry's worth of
//! 512-byte records (including GNU longname/longlink and PAX extension
//! records) and leaves the input positioned at the entry's payload. The
//! supported dialects are v7, ustar, PAX and GNU (including old-style and
//! PAX-style sparse files).
mod header;
mod pax;

use std::fmt;
use std::io::Read;

use bstr::BString;
use zerocopy::FromBytes;

use sqfs::data::SparseSegment;

pub use self::header::canonicalize_name;
use self::header::{
    GnuExtra, RECORD_SIZE, RawHeader, RawSparse, SparseCont, read_number, trim_field,
};
use self::pax::PaxData;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while decoding the tar stream.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    BadChecksum,
    BadNumericField,
    BadPaxRecord(&'static str),
    BadSparse(&'static str),
    Truncated,
    PayloadTooLarge,
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::BadChecksum => f.pad("record checksum mismatch"),
            ErrorInner::BadNumericField => f.pad("malformed numeric header field"),
            ErrorInner::BadPaxRecord(msg) => write!(f, "malformed PAX record: {msg}"),
            ErrorInner::BadSparse(msg) => write!(f, "malformed sparse map: {msg}"),
            ErrorInner::Truncated => f.pad("archive truncated"),
            ErrorInner::PayloadTooLarge => f.pad("extension record payload too large"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

/// Extension records larger than this are rejected rather than buffered.
const MAX_EXTENSION_PAYLOAD: u64 = 16 << 20;

/// The file type of a decoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    /// Ingested as a regular file whose content is the record payload.
    HardLink,
    Symlink,
    Directory,
    CharDev,
    BlockDev,
    Fifo,
}

/// One decoded tar entry, with all extension records folded in.
#[derive(Debug)]
pub struct TarHeader {
    /// Entry path as stored; canonicalize with [`canonicalize_name`].
    pub name: BString,
    /// Symlink or hard-link target.
    pub link_target: Option<BString>,
    pub kind: EntryKind,
    /// Set when the typeflag is not representable; `record_size` still
    /// describes the payload so the entry can be skipped.
    pub unknown_record: bool,
    /// Full `S_IFMT | permission` mode bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub devmajor: u32,
    pub devminor: u32,
    /// Payload bytes on the wire (excluding record padding).
    pub record_size: u64,
    /// Logical file size; differs from `record_size` for sparse files.
    pub actual_size: u64,
    /// Sparse data segments, ending with the zero-count EOF marker.
    pub sparse: Option<Vec<SparseSegment>>,
    pub xattr: Vec<(BString, Vec<u8>)>,
}

/// Check a sparse map against the decoded sizes: monotonic,
/// non-overlapping segments whose byte count matches the wire payload,
/// closed by a zero-count segment at logical EOF.
#[must_use]
pub fn validate_sparse_map(map: &[SparseSegment], record_size: u64, actual_size: u64) -> bool {
    let Some((last, data)) = map.split_last() else {
        return false;
    };
    if last.count != 0 || last.offset != actual_size {
        return false;
    }
    let mut pos = 0u64;
    let mut total = 0u64;
    for seg in data {
        if seg.offset < pos || seg.count == 0 {
            return false;
        }
        let Some(end) = seg.offset.checked_add(seg.count) else {
            return false;
        };
        if end > actual_size {
            return false;
        }
        pos = end;
        total += seg.count;
    }
    total == record_size
}

/// Streaming decoder over a forward-only reader.
pub struct TarReader<R> {
    inner: R,
    /// Accumulated `g` (global) overrides, applied to every later entry.
    global: PaxData,
}

impl<R: fmt::Debug> fmt::Debug for TarReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarReader")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<R: Read> TarReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            global: PaxData::default(),
        }
    }

    /// Decode the next entry, or `None` at the end-of-archive marker (two
    /// all-zero records).
    pub fn read_header(&mut self) -> Result<Option<TarHeader>> {
        let mut longname: Option<BString> = None;
        let mut longlink: Option<BString> = None;
        let mut pax: Option<PaxData> = None;

        loop {
            let rec = self.read_record()?;
            if rec.iter().all(|&b| b == 0) {
                let second = self.read_record()?;
                if second.iter().all(|&b| b == 0) {
                    return Ok(None);
                }
                bail!(ErrorInner::Truncated);
            }

            let raw = RawHeader::ref_from_bytes(&rec).expect("record size matches");
            raw.verify_checksum()?;
            let size = read_number(&raw.size)?;

            match raw.typeflag {
                b'L' => longname = Some(self.read_bytes_payload(size)?),
                b'K' => longlink = Some(self.read_bytes_payload(size)?),
                b'x' => {
                    let payload = self.read_extension_payload(size)?;
                    let data = pax.get_or_insert_with(|| self.global.clone());
                    pax::parse(&payload, data)?;
                }
                b'g' => {
                    let payload = self.read_extension_payload(size)?;
                    pax::parse(&payload, &mut self.global)?;
                }
                _ => {
                    let pax = pax.unwrap_or_else(|| self.global.clone());
                    return self
                        .decode_entry(raw, size, longname, longlink, pax)
                        .map(Some);
                }
            }
        }
    }

    /// Discard the padding after a payload of `size` bytes.
    pub fn skip_padding(&mut self, size: u64) -> Result<()> {
        self.discard(size.next_multiple_of(RECORD_SIZE as u64) - size)
    }

    /// Discard a whole payload including its padding.
    pub fn skip_entry(&mut self, size: u64) -> Result<()> {
        self.discard(size.next_multiple_of(RECORD_SIZE as u64))
    }

    /// The payload reader for the current entry.
    pub fn payload(&mut self, size: u64) -> impl Read + '_ {
        (&mut self.inner).take(size)
    }

    fn decode_entry(
        &mut self,
        raw: &RawHeader,
        size: u64,
        longname: Option<BString>,
        longlink: Option<BString>,
        pax: PaxData,
    ) -> Result<TarHeader> {
        let (kind, type_bits, unknown_record) = match raw.typeflag {
            b'0' | b'\0' | b'7' | b'S' => (EntryKind::Regular, sqfs::format::S_IFREG, false),
            b'1' => (EntryKind::HardLink, sqfs::format::S_IFREG, false),
            b'2' => (EntryKind::Symlink, sqfs::format::S_IFLNK, false),
            b'3' => (EntryKind::CharDev, sqfs::format::S_IFCHR, false),
            b'4' => (EntryKind::BlockDev, sqfs::format::S_IFBLK, false),
            b'5' => (EntryKind::Directory, sqfs::format::S_IFDIR, false),
            b'6' => (EntryKind::Fifo, sqfs::format::S_IFIFO, false),
            _ => (EntryKind::Regular, sqfs::format::S_IFREG, true),
        };

        let mode = read_number(&raw.mode)? as u32 & 0o7777;
        let uid = clamp_id(pax.uid, read_number(&raw.uid)?);
        let gid = clamp_id(pax.gid, read_number(&raw.gid)?);
        let mtime = pax
            .mtime
            .map_or_else(|| read_number(&raw.mtime), Ok)?
            .min(u64::from(u32::MAX)) as u32;

        let mut name = pax
            .sparse
            .name
            .clone()
            .or(pax.path)
            .or(longname)
            .unwrap_or_else(|| raw.full_name());
        // Old archives mark directories only with a trailing slash.
        if name.ends_with(b"/") {
            name.pop();
        }

        let link_target = pax.linkpath.or(longlink).or_else(|| {
            let stored = trim_field(&raw.linkname);
            (!stored.is_empty()).then(|| stored.into())
        });

        let mut record_size = pax.size.unwrap_or(size);
        let mut actual_size = record_size;
        let mut sparse = None;

        if raw.typeflag == b'S' {
            let extra = GnuExtra::ref_from_bytes(&raw.tail).expect("size matches");
            let mut map = Vec::new();
            read_sparse_area(&extra.sparse, &mut map)?;
            let mut extended = extra.isextended != 0;
            while extended {
                let rec = self.read_record()?;
                let cont = SparseCont::ref_from_bytes(&rec).expect("record size matches");
                read_sparse_area(&cont.sparse, &mut map)?;
                extended = cont.isextended != 0;
            }
            actual_size = read_number(&extra.realsize)?;
            sparse = Some(map);
        } else if pax.sparse.seen && kind == EntryKind::Regular && !unknown_record {
            let mut map = pax.sparse.map.clone();
            if pax.sparse.is_v1() {
                let consumed = self.read_v1_sparse_map(&mut map)?;
                record_size = record_size
                    .checked_sub(consumed)
                    .ok_or(ErrorInner::BadSparse("map larger than the payload"))?;
            }
            actual_size = pax
                .sparse
                .real_size
                .ok_or(ErrorInner::BadSparse("missing logical size"))?;
            if map.last().is_none_or(|seg| seg.count != 0) {
                map.push(SparseSegment {
                    offset: actual_size,
                    count: 0,
                });
            }
            sparse = Some(map);
        }

        Ok(TarHeader {
            name,
            link_target,
            kind,
            unknown_record,
            mode: mode | type_bits,
            uid,
            gid,
            mtime,
            devmajor: read_number(&raw.devmajor)? as u32,
            devminor: read_number(&raw.devminor)? as u32,
            record_size,
            actual_size,
            sparse,
            xattr: pax.xattr,
        })
    }

    /// GNU sparse 1.0 stores the map at the start of the payload:
    /// newline-terminated decimal numbers (count, then offset/size
    /// pairs), padded to a record boundary. Returns the bytes consumed.
    fn read_v1_sparse_map(&mut self, map: &mut Vec<SparseSegment>) -> Result<u64> {
        let mut numbers: Vec<u64> = Vec::new();
        let mut wanted = 1usize;
        let mut consumed = 0u64;
        let mut acc: Option<u64> = None;

        while numbers.len() < wanted {
            let rec = self.read_record()?;
            consumed += RECORD_SIZE as u64;
            if consumed > MAX_EXTENSION_PAYLOAD {
                bail!(ErrorInner::PayloadTooLarge);
            }
            for &b in &rec {
                match b {
                    b'0'..=b'9' => {
                        let digit = u64::from(b - b'0');
                        acc = Some(
                            acc.unwrap_or(0)
                                .checked_mul(10)
                                .and_then(|v| v.checked_add(digit))
                                .ok_or(ErrorInner::BadSparse("map value overflow"))?,
                        );
                    }
                    b'\n' => {
                        let value = acc
                            .take()
                            .ok_or(ErrorInner::BadSparse("empty map value"))?;
                        numbers.push(value);
                        if numbers.len() == 1 {
                            let blocks = usize::try_from(value)
                                .ok()
                                .filter(|&n| n <= 1 << 20)
                                .ok_or(ErrorInner::BadSparse("unreasonable segment count"))?;
                            wanted = 1 + blocks * 2;
                        }
                        if numbers.len() == wanted {
                            break;
                        }
                    }
                    _ => bail!(ErrorInner::BadSparse("map is not decimal")),
                }
            }
        }

        map.clear();
        map.extend(numbers[1..].chunks_exact(2).map(|pair| SparseSegment {
            offset: pair[0],
            count: pair[1],
        }));
        Ok(consumed)
    }

    fn read_record(&mut self) -> Result<[u8; RECORD_SIZE]> {
        let mut rec = [0u8; RECORD_SIZE];
        let mut buf = &mut rec[..];
        while !buf.is_empty() {
            match self.inner.read(buf) {
                Ok(0) => bail!(ErrorInner::Truncated),
                Ok(n) => buf = &mut buf[n..],
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!(err),
            }
        }
        Ok(rec)
    }

    /// Read a longname/longlink payload, trimmed at the first NUL.
    fn read_bytes_payload(&mut self, size: u64) -> Result<BString> {
        let payload = self.read_extension_payload(size)?;
        Ok(trim_field(&payload).into())
    }

    fn read_extension_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENSION_PAYLOAD {
            bail!(ErrorInner::PayloadTooLarge);
        }
        let mut payload = vec![0u8; size as usize];
        let mut buf = &mut payload[..];
        while !buf.is_empty() {
            match self.inner.read(buf) {
                Ok(0) => bail!(ErrorInner::Truncated),
                Ok(n) => buf = &mut buf[n..],
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!(err),
            }
        }
        self.skip_padding(size)?;
        Ok(payload)
    }

    fn discard(&mut self, mut count: u64) -> Result<()> {
        let mut scratch = [0u8; RECORD_SIZE];
        while count > 0 {
            let want = count.min(RECORD_SIZE as u64) as usize;
            match self.inner.read(&mut scratch[..want]) {
                Ok(0) => bail!(ErrorInner::Truncated),
                Ok(n) => count -= n as u64,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!(err),
            }
        }
        Ok(())
    }
}

fn clamp_id(pax: Option<u64>, stored: u64) -> u32 {
    pax.unwrap_or(stored).min(u64::from(u32::MAX)) as u32
}

fn read_sparse_area(area: &[RawSparse], map: &mut Vec<SparseSegment>) -> Result<()> {
    for raw in area {
        if trim_field(&raw.offset).is_empty() {
            break;
        }
        map.push(SparseSegment {
            offset: read_number(&raw.offset)?,
            count: read_number(&raw.numbytes)?,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
