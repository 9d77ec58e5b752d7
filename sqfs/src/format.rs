//! The on-disk structures of the SquashFS 4.0 format.
//!
//! All multi-byte integers are little-endian. None of the structures carry
//! alignment requirements; they are written back to back into metadata
//! streams at arbitrary byte offsets.
//!
//! See: <https://dr-emann.github.io/squashfs/squashfs.html>
use bstr::{BStr, ByteSlice};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian as le};

/// The superblock magic, `b"hsqs"` read as a little-endian u32.
pub const MAGIC: u32 = 0x7371_7368;

/// The on-disk format major version. Always 4.
pub const VERSION_MAJOR: u16 = 4;
/// The on-disk format minor version. Always 0.
pub const VERSION_MINOR: u16 = 0;

/// Uncompressed payload size of a metadata block.
pub const META_BLOCK_SIZE: usize = 8192;
/// Set in a metadata block's 16-bit length word when the payload is stored
/// uncompressed.
pub const META_BLOCK_UNCOMPRESSED: u16 = 0x8000;
/// Set in a data block size word (inode block list or fragment entry) when
/// the block is stored uncompressed.
pub const DATA_BLOCK_UNCOMPRESSED: u32 = 1 << 24;

/// Minimum data block size.
pub const MIN_BLOCK_SIZE: u32 = 4096;
/// Maximum data block size.
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
/// Default data block size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 17;

/// Default device block size the image tail is padded to.
pub const DEFAULT_DEV_BLOCK_SIZE: u32 = 4096;
/// Minimum accepted device block size.
pub const MIN_DEV_BLOCK_SIZE: u32 = 1024;

/// Fragment index of inodes without a tail end fragment.
pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;
/// Xattr index of inodes without extended attributes.
pub const NO_XATTR: u32 = 0xFFFF_FFFF;
/// Superblock table offset for tables that are not present.
pub const NO_TABLE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// File type bits of `mode`, as stored in inodes and tar records.
pub const S_IFMT: u32 = 0o0170000;
pub const S_IFSOCK: u32 = 0o0140000;
pub const S_IFLNK: u32 = 0o0120000;
pub const S_IFREG: u32 = 0o0100000;
pub const S_IFBLK: u32 = 0o0060000;
pub const S_IFDIR: u32 = 0o0040000;
pub const S_IFCHR: u32 = 0o0020000;
pub const S_IFIFO: u32 = 0o0010000;

bitflags::bitflags! {
    /// Superblock feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const UNCOMPRESSED_INODES = 0x0001;
        const UNCOMPRESSED_DATA = 0x0002;
        const UNCOMPRESSED_FRAGMENTS = 0x0008;
        const NO_FRAGMENTS = 0x0010;
        const ALWAYS_FRAGMENTS = 0x0020;
        const DUPLICATES = 0x0040;
        const EXPORTABLE = 0x0080;
        const UNCOMPRESSED_XATTRS = 0x0100;
        const NO_XATTRS = 0x0200;
        const COMPRESSOR_OPTIONS = 0x0400;
        const UNCOMPRESSED_IDS = 0x0800;
    }
}

macro_rules! impl_open_enum {
    ($name:ident; $ctor:path; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f
                        .debug_tuple(stringify!($name))
                        .field(&self.0.get())
                        .finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self($ctor($value));
            )*
        }
    };
}

/// The compressor id stored in the superblock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CompressorId(pub le::U16);

impl_open_enum! {
    CompressorId; le::U16::new;

    GZIP = 1,
    LZMA = 2,
    LZO = 3,
    XZ = 4,
    LZ4 = 5,
    ZSTD = 6,
}

/// The type tag of an inode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct InodeType(pub le::U16);

impl_open_enum! {
    InodeType; le::U16::new;

    BASIC_DIR = 1,
    BASIC_FILE = 2,
    BASIC_SYMLINK = 3,
    BASIC_BLOCK_DEV = 4,
    BASIC_CHAR_DEV = 5,
    BASIC_FIFO = 6,
    BASIC_SOCKET = 7,
    EXT_DIR = 8,
    EXT_FILE = 9,
    EXT_SYMLINK = 10,
    EXT_BLOCK_DEV = 11,
    EXT_CHAR_DEV = 12,
    EXT_FIFO = 13,
    EXT_SOCKET = 14,
}

impl InodeType {
    /// The basic inode type corresponding to the file type bits of `mode`.
    ///
    /// Directory entries always store the basic type, even when the inode
    /// itself uses the extended encoding.
    #[must_use]
    pub fn basic_of_mode(mode: u32) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFDIR => Self::BASIC_DIR,
            S_IFREG => Self::BASIC_FILE,
            S_IFLNK => Self::BASIC_SYMLINK,
            S_IFBLK => Self::BASIC_BLOCK_DEV,
            S_IFCHR => Self::BASIC_CHAR_DEV,
            S_IFIFO => Self::BASIC_FIFO,
            S_IFSOCK => Self::BASIC_SOCKET,
            _ => return None,
        })
    }

    /// The extended counterpart of a basic inode type.
    #[must_use]
    pub fn to_extended(self) -> Self {
        Self(le::U16::new(self.0.get() + 7))
    }
}

/// The 96-byte block at offset zero of every image.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SuperBlock {
    pub magic: le::U32,
    pub inode_count: le::U32,
    pub modification_time: le::U32,
    pub block_size: le::U32,
    pub fragment_entry_count: le::U32,
    pub compressor: CompressorId,
    pub block_log: le::U16,
    pub flags: le::U16,
    pub id_count: le::U16,
    pub version_major: le::U16,
    pub version_minor: le::U16,
    pub root_inode_ref: le::U64,
    pub bytes_used: le::U64,
    pub id_table_start: le::U64,
    pub xattr_id_table_start: le::U64,
    pub inode_table_start: le::U64,
    pub directory_table_start: le::U64,
    pub fragment_table_start: le::U64,
    pub export_table_start: le::U64,
}

const _: () = assert!(size_of::<SuperBlock>() == 96);

impl SuperBlock {
    /// Create a superblock for a fresh image.
    ///
    /// Table offsets are initialized to [`NO_TABLE`] and filled in as the
    /// tables are written; `block_size` must be a power of two within
    /// [`MIN_BLOCK_SIZE`]..=[`MAX_BLOCK_SIZE`].
    pub fn new(block_size: u32, modification_time: u32, compressor: CompressorId) -> crate::Result<Self> {
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            bail!(crate::ErrorInner::Limit(
                "block size must be a power of two between 4 KiB and 1 MiB"
            ));
        }
        Ok(Self {
            magic: le::U32::new(MAGIC),
            inode_count: le::U32::new(0),
            modification_time: le::U32::new(modification_time),
            block_size: le::U32::new(block_size),
            fragment_entry_count: le::U32::new(0),
            compressor,
            block_log: le::U16::new(block_size.trailing_zeros() as u16),
            flags: le::U16::new((Flags::NO_FRAGMENTS | Flags::NO_XATTRS | Flags::DUPLICATES).bits()),
            id_count: le::U16::new(0),
            version_major: le::U16::new(VERSION_MAJOR),
            version_minor: le::U16::new(VERSION_MINOR),
            root_inode_ref: le::U64::new(0),
            bytes_used: le::U64::new(0),
            id_table_start: le::U64::new(NO_TABLE),
            xattr_id_table_start: le::U64::new(NO_TABLE),
            inode_table_start: le::U64::new(NO_TABLE),
            directory_table_start: le::U64::new(NO_TABLE),
            fragment_table_start: le::U64::new(NO_TABLE),
            export_table_start: le::U64::new(NO_TABLE),
        })
    }

    pub fn set_flag(&mut self, flag: Flags) {
        self.flags = le::U16::new(self.flags.get() | flag.bits());
    }

    pub fn clear_flag(&mut self, flag: Flags) {
        self.flags = le::U16::new(self.flags.get() & !flag.bits());
    }

    #[must_use]
    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.get() & flag.bits() == flag.bits()
    }
}

/// Pack a 48-bit inode reference: the on-disk offset of the metadata block
/// holding the inode (relative to the inode table start) in the upper
/// bits, the byte offset inside the uncompressed block in the lower 16.
#[must_use]
pub fn inode_ref(block_start: u64, offset: u16) -> u64 {
    (block_start << 16) | u64::from(offset)
}

/// Pack a device number the way Linux and SquashFS encode it.
#[must_use]
pub fn encode_devno(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff) | ((minor & !0xff) << 12)
}

/// The header shared by all 14 inode variants.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct InodeHeader {
    pub inode_type: InodeType,
    /// Permission bits only; the file type lives in `inode_type`.
    pub mode: le::U16,
    pub uid_idx: le::U16,
    pub gid_idx: le::U16,
    pub modification_time: le::U32,
    pub inode_number: le::U32,
}

const _: () = assert!(size_of::<InodeHeader>() == 16);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirInode {
    pub block_index: le::U32,
    pub nlink: le::U32,
    /// Listing size + 3 (the implied `.` and `..` entries).
    pub size: le::U16,
    pub offset: le::U16,
    pub parent_inode: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ExtDirInode {
    pub nlink: le::U32,
    pub size: le::U32,
    pub block_index: le::U32,
    pub parent_inode: le::U32,
    pub index_count: le::U16,
    pub offset: le::U16,
    pub xattr_idx: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FileInode {
    pub blocks_start: le::U32,
    pub fragment_index: le::U32,
    pub fragment_offset: le::U32,
    pub size: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ExtFileInode {
    pub blocks_start: le::U64,
    pub size: le::U64,
    /// Number of bytes saved by hole (all-zero) blocks.
    pub sparse: le::U64,
    pub nlink: le::U32,
    pub fragment_index: le::U32,
    pub fragment_offset: le::U32,
    pub xattr_idx: le::U32,
}

/// Followed on disk by the target bytes, and for [`InodeType::EXT_SYMLINK`]
/// by a 32-bit xattr index after the target.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SymlinkInode {
    pub nlink: le::U32,
    pub target_size: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DevInode {
    pub nlink: le::U32,
    pub devno: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ExtDevInode {
    pub nlink: le::U32,
    pub devno: le::U32,
    pub xattr_idx: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IpcInode {
    pub nlink: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ExtIpcInode {
    pub nlink: le::U32,
    pub xattr_idx: le::U32,
}

/// Starts a run of directory entries sharing one inode metadata block.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirHeader {
    /// One less than the number of entries in the run.
    pub count: le::U32,
    /// Metadata block of the entries' inodes, relative to the inode table.
    pub start: le::U32,
    /// Base inode number; entries store 16-bit deltas.
    pub inode_number: le::U32,
}

/// Followed on disk by the entry name.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirEntry {
    /// Offset of the inode inside its metadata block.
    pub offset: le::U16,
    pub inode_diff: le::I16,
    /// Basic inode type of the target.
    pub inode_type: le::U16,
    /// One less than the name length.
    pub name_size: le::U16,
}

/// Fast-lookup index entry of an extended directory inode. Followed on
/// disk by the name of the run's first entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirIndex {
    /// Byte offset of the run header in the uncompressed listing.
    pub index: le::U32,
    /// Metadata block of the run, relative to the directory table start.
    pub start: le::U32,
    /// One less than the name length.
    pub name_size: le::U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FragmentEntry {
    /// Absolute offset of the fragment block.
    pub start: le::U64,
    /// On-disk size; [`DATA_BLOCK_UNCOMPRESSED`] marks uncompressed storage.
    pub size: le::U32,
    pub unused: le::U32,
}

const _: () = assert!(size_of::<FragmentEntry>() == 16);

// Xattr key prefixes SquashFS can represent.
pub const XATTR_PREFIX_USER: u16 = 0;
pub const XATTR_PREFIX_TRUSTED: u16 = 1;
pub const XATTR_PREFIX_SECURITY: u16 = 2;

/// Split an xattr key into its numeric prefix id and remainder.
///
/// Returns `None` for prefixes SquashFS cannot store.
#[must_use]
pub fn split_xattr_prefix(key: &BStr) -> Option<(u16, &BStr)> {
    for (prefix, id) in [
        (&b"user."[..], XATTR_PREFIX_USER),
        (&b"trusted."[..], XATTR_PREFIX_TRUSTED),
        (&b"security."[..], XATTR_PREFIX_SECURITY),
    ] {
        if let Some(rest) = key.strip_prefix(prefix) {
            return Some((id, rest.as_bstr()));
        }
    }
    None
}

/// Key record of the xattr key-value stream. Followed by the name bytes
/// (without the prefix), then a [`XattrValue`] record.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct XattrKey {
    pub prefix: le::U16,
    pub name_size: le::U16,
}

/// Value record of the xattr key-value stream. Followed by the value bytes.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct XattrValue {
    pub size: le::U32,
}

/// One record of the xattr id stream, describing an attribute set.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct XattrIdEntry {
    /// Reference (block << 16 | offset) into the key-value stream.
    pub xattr_ref: le::U64,
    /// Number of key-value pairs.
    pub count: le::U32,
    /// Uncompressed bytes the set occupies in the key-value stream.
    pub size: le::U32,
}

/// Header at `xattr_id_table_start`, followed by the uncompressed index of
/// id-stream metadata block offsets.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct XattrIdTable {
    pub kv_start: le::U64,
    pub count: le::U32,
    pub unused: le::U32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_struct_sizes() {
        assert_eq!(size_of::<DirInode>(), 16);
        assert_eq!(size_of::<ExtDirInode>(), 24);
        assert_eq!(size_of::<FileInode>(), 16);
        assert_eq!(size_of::<ExtFileInode>(), 40);
        assert_eq!(size_of::<SymlinkInode>(), 8);
        assert_eq!(size_of::<DevInode>(), 8);
        assert_eq!(size_of::<ExtDevInode>(), 12);
        assert_eq!(size_of::<IpcInode>(), 4);
        assert_eq!(size_of::<ExtIpcInode>(), 8);
        assert_eq!(size_of::<DirHeader>(), 12);
        assert_eq!(size_of::<DirEntry>(), 8);
        assert_eq!(size_of::<DirIndex>(), 12);
        assert_eq!(size_of::<XattrIdEntry>(), 16);
        assert_eq!(size_of::<XattrIdTable>(), 16);
    }

    #[test]
    fn superblock_defaults() {
        let sb = SuperBlock::new(DEFAULT_BLOCK_SIZE, 0, CompressorId::GZIP).unwrap();
        assert_eq!(sb.block_log.get(), 17);
        assert!(sb.has_flag(Flags::NO_XATTRS));
        assert!(sb.has_flag(Flags::NO_FRAGMENTS));
        assert!(!sb.has_flag(Flags::EXPORTABLE));

        assert!(SuperBlock::new(100, 0, CompressorId::GZIP).is_err());
        assert!(SuperBlock::new(2048, 0, CompressorId::GZIP).is_err());
        assert!(SuperBlock::new(2 << 20, 0, CompressorId::GZIP).is_err());
    }

    #[test]
    fn devno_packing() {
        assert_eq!(encode_devno(8, 1), 0x801);
        assert_eq!(encode_devno(259, 0x1_0002), 0x1001_0302);
    }

    #[test]
    fn xattr_prefixes() {
        use bstr::ByteSlice;
        let (id, rest) = split_xattr_prefix(b"user.foo".as_bstr()).unwrap();
        assert_eq!((id, ByteSlice::as_bytes(&**rest)), (XATTR_PREFIX_USER, &b"foo"[..]));
        let (id, _) = split_xattr_prefix(b"security.selinux".as_bstr()).unwrap();
        assert_eq!(id, XATTR_PREFIX_SECURITY);
        assert!(split_xattr_prefix(b"system.posix_acl_access".as_bstr()).is_none());
    }
}
