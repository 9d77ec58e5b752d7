use super::*;
use crate::tar::header::RECORD_SIZE;

fn octal(field: &mut [u8], value: u64) {
    let text = format!("{value:00$o}", field.len() - 1);
    field[..text.len()].copy_from_slice(text.as_bytes());
}

fn finish_record(rec: &mut [u8; RECORD_SIZE]) {
    rec[148..156].fill(b' ');
    let sum: u64 = rec.iter().map(|&b| u64::from(b)).sum();
    let text = format!("{sum:06o}\0 ");
    rec[148..156].copy_from_slice(text.as_bytes());
}

fn ustar_record(name: &str, size: u64, typeflag: u8) -> [u8; RECORD_SIZE] {
    let mut rec = [0u8; RECORD_SIZE];
    rec[..name.len()].copy_from_slice(name.as_bytes());
    octal(&mut rec[100..108], 0o644);
    octal(&mut rec[108..116], 0o1750);
    octal(&mut rec[116..124], 0o1750);
    octal(&mut rec[124..136], size);
    octal(&mut rec[136..148], 1_234_567_890);
    rec[156] = typeflag;
    rec[257..263].copy_from_slice(b"ustar\0");
    rec[263..265].copy_from_slice(b"00");
    finish_record(&mut rec);
    rec
}

fn end_of_archive() -> Vec<u8> {
    vec![0u8; RECORD_SIZE * 2]
}

fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
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

fn padded(mut payload: Vec<u8>) -> Vec<u8> {
    let len = payload.len().next_multiple_of(RECORD_SIZE);
    payload.resize(len, 0);
    payload
}

#[test]
fn plain_ustar_file() {
    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("dir/file.txt", 42, b'0'));
    tar.extend(padded(vec![b'x'; 42]));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    let hdr = rdr.read_header().unwrap().unwrap();
    assert_eq!(hdr.name, "dir/file.txt");
    assert_eq!(hdr.kind, EntryKind::Regular);
    assert!(!hdr.unknown_record);
    assert_eq!(hdr.mode, sqfs::format::S_IFREG | 0o644);
    assert_eq!((hdr.uid, hdr.gid), (0o1750, 0o1750));
    assert_eq!(hdr.mtime, 1_234_567_890);
    assert_eq!((hdr.record_size, hdr.actual_size), (42, 42));
    assert!(hdr.sparse.is_none());

    rdr.skip_entry(hdr.record_size).unwrap();
    assert!(rdr.read_header().unwrap().is_none());
}

#[test]
fn ustar_prefix_is_spliced() {
    let mut rec = ustar_record("leaf.txt", 0, b'0');
    rec[345..345 + 9].copy_from_slice(b"some/deep");
    finish_record(&mut rec);

    let mut tar = rec.to_vec();
    tar.extend(end_of_archive());
    let hdr = TarReader::new(&tar[..]).read_header().unwrap().unwrap();
    assert_eq!(hdr.name, "some/deep/leaf.txt");
}

#[test]
fn gnu_longname_replaces_name() {
    let long = "a/".repeat(80) + "tail.bin";
    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("././@LongLink", long.len() as u64, b'L'));
    tar.extend(padded(long.clone().into_bytes()));
    tar.extend_from_slice(&ustar_record("truncated", 7, b'0'));
    tar.extend(padded(b"payload".to_vec()));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    let hdr = rdr.read_header().unwrap().unwrap();
    assert_eq!(hdr.name, long.as_str());
    assert_eq!(hdr.record_size, 7);
}

#[test]
fn pax_overrides_and_xattrs() {
    let mut pax = pax_record("path", b"renamed/entry.dat");
    pax.extend(pax_record("size", b"5"));
    pax.extend(pax_record("uid", b"4242"));
    pax.extend(pax_record("SCHILY.xattr.user.foo", b"bar"));
    pax.extend(pax_record(
        "LIBARCHIVE.xattr.security.selinux",
        b"c3lzdGVtX3U=",
    ));

    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("old-name", pax.len() as u64, b'x'));
    tar.extend(padded(pax));
    tar.extend_from_slice(&ustar_record("old-name", 5, b'0'));
    tar.extend(padded(b"12345".to_vec()));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    let hdr = rdr.read_header().unwrap().unwrap();
    assert_eq!(hdr.name, "renamed/entry.dat");
    assert_eq!(hdr.record_size, 5);
    assert_eq!(hdr.uid, 4242);
    assert_eq!(
        hdr.xattr,
        vec![
            (BString::from("user.foo"), b"bar".to_vec()),
            (BString::from("security.selinux"), b"system_u".to_vec()),
        ]
    );
}

#[test]
fn global_header_applies_to_later_entries() {
    let global = pax_record("uid", b"9999");
    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("ignored", global.len() as u64, b'g'));
    tar.extend(padded(global));
    tar.extend_from_slice(&ustar_record("a", 0, b'0'));
    tar.extend_from_slice(&ustar_record("b", 0, b'0'));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    assert_eq!(rdr.read_header().unwrap().unwrap().uid, 9999);
    assert_eq!(rdr.read_header().unwrap().unwrap().uid, 9999);
}

#[test]
fn old_gnu_sparse_map() {
    // Mirrors a GNU tar sparse member: 2 MiB logical, eight 4 KiB data
    // segments 256 KiB apart, EOF marker entry, map split across the
    // header and one continuation record.
    let mut rec = ustar_record("input.bin", 8 * 4096, b'S');
    rec[257..265].copy_from_slice(b"ustar  \0");
    let segments: Vec<(u64, u64)> = (0..8).map(|i| (i * 262_144, 4096)).collect();
    for (slot, &(offset, count)) in segments[..4].iter().enumerate() {
        let at = 386 + slot * 24;
        octal(&mut rec[at..at + 12], offset);
        octal(&mut rec[at + 12..at + 24], count);
    }
    rec[482] = 1; // continued
    octal(&mut rec[483..495], 2_097_152);
    finish_record(&mut rec);

    let mut cont = [0u8; RECORD_SIZE];
    for (slot, &(offset, count)) in segments[4..].iter().enumerate() {
        let at = slot * 24;
        octal(&mut cont[at..at + 12], offset);
        octal(&mut cont[at + 12..at + 24], count);
    }
    octal(&mut cont[96..108], 2_097_152);
    octal(&mut cont[108..120], 0);

    let mut tar = rec.to_vec();
    tar.extend_from_slice(&cont);
    tar.extend(padded(vec![0xAB; 8 * 4096]));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    let hdr = rdr.read_header().unwrap().unwrap();
    assert_eq!(hdr.name, "input.bin");
    assert_eq!(hdr.mode, sqfs::format::S_IFREG | 0o644);
    assert_eq!(hdr.record_size, 32768);
    assert_eq!(hdr.actual_size, 2_097_152);
    assert!(!hdr.unknown_record);

    let map = hdr.sparse.as_deref().unwrap();
    assert_eq!(map.len(), 9);
    assert_eq!(map[0], sqfs::data::SparseSegment { offset: 0, count: 4096 });
    assert_eq!(
        map[7],
        sqfs::data::SparseSegment {
            offset: 1_835_008,
            count: 4096
        }
    );
    assert_eq!(
        map[8],
        sqfs::data::SparseSegment {
            offset: 2_097_152,
            count: 0
        }
    );
    assert!(validate_sparse_map(map, hdr.record_size, hdr.actual_size));
}

#[test]
fn pax_sparse_1_0_map_in_payload() {
    let mut pax = pax_record("GNU.sparse.major", b"1");
    pax.extend(pax_record("GNU.sparse.minor", b"0"));
    pax.extend(pax_record("GNU.sparse.name", b"big.img"));
    pax.extend(pax_record("GNU.sparse.realsize", b"1048576"));

    // Map block: two segments, then the data bytes.
    let map_block = padded(b"2\n0\n512\n524288\n512\n".to_vec());
    let wire_size = map_block.len() as u64 + 1024;

    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("GNUSparseFile.0/big.img", pax.len() as u64, b'x'));
    tar.extend(padded(pax));
    tar.extend_from_slice(&ustar_record("GNUSparseFile.0/big.img", wire_size, b'0'));
    tar.extend(map_block);
    tar.extend(padded(vec![0xCD; 1024]));
    tar.extend(end_of_archive());

    let mut rdr = TarReader::new(&tar[..]);
    let hdr = rdr.read_header().unwrap().unwrap();
    assert_eq!(hdr.name, "big.img");
    assert_eq!(hdr.record_size, 1024);
    assert_eq!(hdr.actual_size, 1_048_576);

    let map = hdr.sparse.as_deref().unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map[1], sqfs::data::SparseSegment { offset: 524_288, count: 512 });
    assert_eq!(map[2], sqfs::data::SparseSegment { offset: 1_048_576, count: 0 });
    assert!(validate_sparse_map(map, hdr.record_size, hdr.actual_size));
}

#[test]
fn unknown_typeflag_is_flagged() {
    let mut tar = Vec::new();
    tar.extend_from_slice(&ustar_record("volume", 0, b'V'));
    tar.extend(end_of_archive());
    let hdr = TarReader::new(&tar[..]).read_header().unwrap().unwrap();
    assert!(hdr.unknown_record);
}

#[test]
fn checksum_mismatch_is_rejected() {
    let mut rec = ustar_record("file", 0, b'0');
    rec[0] ^= 0xFF;
    let mut tar = rec.to_vec();
    tar.extend(end_of_archive());
    assert!(TarReader::new(&tar[..]).read_header().is_err());
}

#[test]
fn lone_zero_record_is_truncation() {
    let mut tar = vec![0u8; RECORD_SIZE];
    tar.extend_from_slice(&ustar_record("file", 0, b'0'));
    assert!(TarReader::new(&tar[..]).read_header().is_err());
}

#[test]
fn sparse_map_validation() {
    use sqfs::data::SparseSegment;
    let seg = |offset, count| SparseSegment { offset, count };

    // Monotonic, sums match, proper terminator.
    assert!(validate_sparse_map(
        &[seg(0, 512), seg(4096, 512), seg(8192, 0)],
        1024,
        8192
    ));
    // All-holes file: only the terminator.
    assert!(validate_sparse_map(&[seg(4096, 0)], 0, 4096));
    // Wire size mismatch.
    assert!(!validate_sparse_map(&[seg(0, 512), seg(8192, 0)], 1024, 8192));
    // Overlapping segments.
    assert!(!validate_sparse_map(
        &[seg(0, 512), seg(256, 512), seg(8192, 0)],
        1024,
        8192
    ));
    // Terminator not at logical EOF.
    assert!(!validate_sparse_map(&[seg(0, 512), seg(4096, 0)], 512, 8192));
    // Empty map.
    assert!(!validate_sparse_map(&[], 0, 0));
}
