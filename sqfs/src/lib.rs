//! A library for writing [SquashFS][squashfs] 4.0 archives (aka. images).
//!
//! [squashfs]: https://docs.kernel.org/filesystems/squashfs.html
//!
//! The crate provides the building blocks a packer needs, in roughly the
//! order they are used:
//!
//! - [`file::OutputFile`]: the random-access output sink.
//! - [`compress::Compressor`]: the pluggable block compressor.
//! - [`data::DataWriter`]: parallel compression of file contents into data
//!   blocks and packed fragments, with content deduplication.
//! - [`meta::MetaWriter`] and [`dir::DirWriter`]: the compressed metadata
//!   streams holding inodes and directory listings.
//! - [`id_table::IdTable`], [`xattr::XattrTable`], [`data::FragmentTable`]
//!   and [`table::write_table`]: the lookup tables referenced from the
//!   superblock.
//! - [`format`]: the raw on-disk structures, shared by all of the above.
//!
//! Images are always produced for on-disk format version 4.0, the only
//! version current kernels mount.
//!
//! ## Cargo features
//!
//! - `gzip`, `zstd` *(enabled by default)*, `lzma`, `lz4`
//!
//!   Enable the relevant compression backends. Readers of the produced
//!   images almost always expect gzip, so leaving it enabled is a good
//!   idea.
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

#[cfg(feature = "log")]
#[macro_use(trace)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;
mod pool;

pub mod compress;
pub mod data;
pub mod dir;
pub mod file;
pub mod format;
pub mod id_table;
pub mod meta;
pub mod table;
pub mod xattr;

pub use positioned_io;

use self::error::ErrorInner;
pub use self::error::{Error, Result};
