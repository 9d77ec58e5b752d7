//! PAX extended-header records.
//!
//! The payload of an `x` (per-entry) or `g` (global) record is a sequence
//! of `"<len> <key>=<value>\n"` lines where `len` counts the whole line
//! including itself. Values may be binary (xattrs).
use base64::Engine;
use bstr::{BString, ByteSlice};

use sqfs::data::SparseSegment;

use super::{ErrorInner, Result};

/// Accumulated overrides from PAX records. A per-entry record starts from
/// a clone of the global state, so later `x` values win over `g` ones.
#[derive(Debug, Default, Clone)]
pub struct PaxData {
    pub path: Option<BString>,
    pub linkpath: Option<BString>,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    // Recognized so they do not trip the unknown-key path; the packer
    // stores numeric ids only.
    pub uname: Option<BString>,
    pub gname: Option<BString>,
    pub xattr: Vec<(BString, Vec<u8>)>,
    pub sparse: SparseState,
}

/// State of the GNU sparse mini state machine: pairs arrive either as a
/// `map` CSV (0.1), as alternating `offset`/`numbytes` keys (0.0), or only
/// announced here and stored in the payload (1.0).
#[derive(Debug, Default, Clone)]
pub struct SparseState {
    pub seen: bool,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub name: Option<BString>,
    pub real_size: Option<u64>,
    pub map: Vec<SparseSegment>,
    pending_offset: Option<u64>,
}

impl SparseState {
    /// Sparse format 1.0 stores its map in the entry payload.
    #[must_use]
    pub fn is_v1(&self) -> bool {
        self.major == Some(1)
    }
}

/// Parse one PAX payload into `out`.
pub fn parse(payload: &[u8], out: &mut PaxData) -> Result<()> {
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ErrorInner::BadPaxRecord("missing length delimiter"))?;
        let len: usize = rest[..space]
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&l| l > space + 1 && l <= rest.len())
            .ok_or(ErrorInner::BadPaxRecord("invalid record length"))?;

        let record = &rest[space + 1..len];
        rest = &rest[len..];

        let record = record
            .strip_suffix(b"\n")
            .ok_or(ErrorInner::BadPaxRecord("record not newline terminated"))?;
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or(ErrorInner::BadPaxRecord("missing key delimiter"))?;
        apply(out, &record[..eq], &record[eq + 1..])?;
    }
    Ok(())
}

fn apply(out: &mut PaxData, key: &[u8], value: &[u8]) -> Result<()> {
    if let Some(gnu_key) = key.strip_prefix(b"GNU.sparse.") {
        return apply_sparse(&mut out.sparse, gnu_key, value);
    }
    if let Some(name) = key.strip_prefix(b"SCHILY.xattr.") {
        out.xattr.push((name.into(), value.to_vec()));
        return Ok(());
    }
    if let Some(name) = key.strip_prefix(b"LIBARCHIVE.xattr.") {
        out.xattr.push((name.into(), decode_base64(value)?));
        return Ok(());
    }

    match key {
        b"path" => out.path = Some(value.into()),
        b"linkpath" => out.linkpath = Some(value.into()),
        b"size" => out.size = Some(parse_decimal(value)?),
        b"mtime" => out.mtime = Some(parse_seconds(value)?),
        b"uid" => out.uid = Some(parse_decimal(value)?),
        b"gid" => out.gid = Some(parse_decimal(value)?),
        b"uname" => out.uname = Some(value.into()),
        b"gname" => out.gname = Some(value.into()),
        // Unrecognized keywords (atime, charset, comment, ...) carry
        // nothing the image stores.
        _ => {}
    }
    Ok(())
}

fn apply_sparse(sparse: &mut SparseState, key: &[u8], value: &[u8]) -> Result<()> {
    sparse.seen = true;
    match key {
        b"major" => sparse.major = Some(parse_decimal(value)? as u32),
        b"minor" => sparse.minor = Some(parse_decimal(value)? as u32),
        b"name" => sparse.name = Some(value.into()),
        b"realsize" | b"size" => sparse.real_size = Some(parse_decimal(value)?),
        b"numblocks" => {
            sparse.map.clear();
            sparse.map.reserve(parse_decimal(value)?.min(1 << 16) as usize);
        }
        b"offset" => sparse.pending_offset = Some(parse_decimal(value)?),
        b"numbytes" => {
            let offset = sparse
                .pending_offset
                .take()
                .ok_or(ErrorInner::BadSparse("numbytes without a preceding offset"))?;
            sparse.map.push(SparseSegment {
                offset,
                count: parse_decimal(value)?,
            });
        }
        b"map" => {
            sparse.map.clear();
            let mut numbers = value.split(|&b| b == b',').map(parse_decimal);
            while let Some(offset) = numbers.next() {
                let count = numbers
                    .next()
                    .ok_or(ErrorInner::BadSparse("odd number of map values"))??;
                sparse.map.push(SparseSegment {
                    offset: offset?,
                    count,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_decimal(value: &[u8]) -> Result<u64> {
    value
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ErrorInner::BadPaxRecord("invalid decimal value").into())
}

/// Timestamps may carry a fractional part; it is truncated. Negative
/// times clamp to the epoch.
fn parse_seconds(value: &[u8]) -> Result<u64> {
    if value.starts_with(b"-") {
        return Ok(0);
    }
    let whole = value.split(|&b| b == b'.').next().unwrap_or(value);
    parse_decimal(whole)
}

fn decode_base64(value: &[u8]) -> Result<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

    // Writers disagree on padding; accept both.
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value.trim_end_with(|c| c == '\n')))
        .map_err(|_| ErrorInner::BadPaxRecord("invalid base64 xattr value").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &[u8]) -> Vec<u8> {
        // len = digits + 1 (space) + key + 1 (=) + value + 1 (newline)
        let body_len = key.len() + value.len() + 2;
        let mut len = body_len + 1;
        while len != body_len + len.to_string().len() + 1 {
            len = body_len + len.to_string().len() + 1;
        }
        let mut out = format!("{len} {key}=").into_bytes();
        out.extend_from_slice(value);
        out.push(b'\n');
        out
    }

    #[test]
    fn basic_overrides() {
        let mut payload = record("path", b"some/long/path.txt");
        payload.extend(record("size", b"1234"));
        payload.extend(record("mtime", b"1570732800.25"));
        payload.extend(record("uid", b"1000"));

        let mut out = PaxData::default();
        parse(&payload, &mut out).unwrap();
        assert_eq!(out.path, Some(BString::from("some/long/path.txt")));
        assert_eq!(out.size, Some(1234));
        assert_eq!(out.mtime, Some(1_570_732_800));
        assert_eq!(out.uid, Some(1000));
        assert!(!out.sparse.seen);
    }

    #[test]
    fn later_records_override() {
        let mut payload = record("path", b"first");
        payload.extend(record("path", b"second"));
        let mut out = PaxData::default();
        parse(&payload, &mut out).unwrap();
        assert_eq!(out.path, Some(BString::from("second")));
    }

    #[test]
    fn vendor_xattrs() {
        let mut payload = record("SCHILY.xattr.user.foo", b"bar");
        payload.extend(record("LIBARCHIVE.xattr.security.selinux", b"c3lzdGVtX3U="));

        let mut out = PaxData::default();
        parse(&payload, &mut out).unwrap();
        assert_eq!(
            out.xattr,
            vec![
                (BString::from("user.foo"), b"bar".to_vec()),
                (BString::from("security.selinux"), b"system_u".to_vec()),
            ]
        );
    }

    #[test]
    fn sparse_0_0_pairs() {
        let mut payload = record("GNU.sparse.size", b"8192");
        payload.extend(record("GNU.sparse.numblocks", b"2"));
        payload.extend(record("GNU.sparse.offset", b"0"));
        payload.extend(record("GNU.sparse.numbytes", b"512"));
        payload.extend(record("GNU.sparse.offset", b"4096"));
        payload.extend(record("GNU.sparse.numbytes", b"512"));

        let mut out = PaxData::default();
        parse(&payload, &mut out).unwrap();
        assert_eq!(out.sparse.real_size, Some(8192));
        assert_eq!(
            out.sparse.map,
            vec![
                SparseSegment { offset: 0, count: 512 },
                SparseSegment { offset: 4096, count: 512 },
            ]
        );
    }

    #[test]
    fn sparse_0_1_map() {
        let payload = record("GNU.sparse.map", b"0,512,4096,512");
        let mut out = PaxData::default();
        parse(&payload, &mut out).unwrap();
        assert_eq!(out.sparse.map.len(), 2);
        assert_eq!(out.sparse.map[1], SparseSegment { offset: 4096, count: 512 });
    }

    #[test]
    fn malformed_records() {
        let mut out = PaxData::default();
        assert!(parse(b"nonsense", &mut out).is_err());
        assert!(parse(b"7 a=b\n", &mut out).is_err());
        let numbytes_first = record("GNU.sparse.numbytes", b"512");
        assert!(parse(&numbytes_first, &mut out).is_err());
    }
}
