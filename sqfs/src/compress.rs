//! The pluggable block compressor.
//!
//! SquashFS compresses data blocks, fragment blocks and metadata blocks
//! with a single algorithm selected in the superblock. [`Compressor`] is a
//! closed set of backends dispatched by tag; each worker thread of the
//! data writer holds its own clone.
use zerocopy::{Immutable, IntoBytes, little_endian as le};

use crate::{ErrorInner, Result, format::CompressorId};

#[cfg(feature = "gzip")]
const GZIP_DEFAULT_LEVEL: u32 = 9;
#[cfg(feature = "gzip")]
const GZIP_DEFAULT_WINDOW: u16 = 15;
#[cfg(feature = "zstd")]
const ZSTD_DEFAULT_LEVEL: i32 = 15;

/// A block compressor.
///
/// Cheap to clone; clones share no state and may be used from different
/// threads concurrently.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Compressor {
    #[cfg(feature = "gzip")]
    Gzip { level: u32, window: u16 },
    #[cfg(feature = "lzma")]
    Xz { dict_size: u32 },
    #[cfg(feature = "lz4")]
    Lz4 { high_compression: bool },
    #[cfg(feature = "zstd")]
    Zstd { level: i32 },
}

impl Compressor {
    /// The default compressor: gzip when built in, otherwise the first
    /// available backend.
    pub fn default_compressor(block_size: u32) -> Self {
        let _ = block_size;
        #[cfg(feature = "gzip")]
        return Self::Gzip {
            level: GZIP_DEFAULT_LEVEL,
            window: GZIP_DEFAULT_WINDOW,
        };
        #[cfg(all(not(feature = "gzip"), feature = "zstd"))]
        return Self::Zstd {
            level: ZSTD_DEFAULT_LEVEL,
        };
        #[cfg(all(not(feature = "gzip"), not(feature = "zstd"), feature = "lzma"))]
        return Self::Xz {
            dict_size: block_size,
        };
        #[cfg(all(
            not(feature = "gzip"),
            not(feature = "zstd"),
            not(feature = "lzma"),
            feature = "lz4"
        ))]
        return Self::Lz4 {
            high_compression: false,
        };
        #[cfg(not(any(feature = "gzip", feature = "zstd", feature = "lzma", feature = "lz4")))]
        compile_error!("at least one compressor feature must be enabled");
    }

    /// Look up a compressor by its user-facing name.
    pub fn by_name(name: &str, block_size: u32) -> Result<Self> {
        let _ = block_size;
        match name {
            #[cfg(feature = "gzip")]
            "gzip" => Ok(Self::Gzip {
                level: GZIP_DEFAULT_LEVEL,
                window: GZIP_DEFAULT_WINDOW,
            }),
            #[cfg(feature = "lzma")]
            "xz" => Ok(Self::Xz {
                dict_size: block_size,
            }),
            #[cfg(feature = "lz4")]
            "lz4" => Ok(Self::Lz4 {
                high_compression: false,
            }),
            #[cfg(feature = "zstd")]
            "zstd" => Ok(Self::Zstd {
                level: ZSTD_DEFAULT_LEVEL,
            }),
            _ => Err(ErrorInner::UnknownCompressor(name.into()).into()),
        }
    }

    /// Names of the backends built into this binary.
    #[must_use]
    pub fn available() -> &'static [&'static str] {
        &[
            #[cfg(feature = "gzip")]
            "gzip",
            #[cfg(feature = "lzma")]
            "xz",
            #[cfg(feature = "lz4")]
            "lz4",
            #[cfg(feature = "zstd")]
            "zstd",
        ]
    }

    /// The user-facing name of this backend.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => "gzip",
            #[cfg(feature = "lzma")]
            Self::Xz { .. } => "xz",
            #[cfg(feature = "lz4")]
            Self::Lz4 { .. } => "lz4",
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => "zstd",
        }
    }

    /// The compressor id to store in the superblock.
    #[must_use]
    pub fn id(&self) -> CompressorId {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => CompressorId::GZIP,
            #[cfg(feature = "lzma")]
            Self::Xz { .. } => CompressorId::XZ,
            #[cfg(feature = "lz4")]
            Self::Lz4 { .. } => CompressorId::LZ4,
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => CompressorId::ZSTD,
        }
    }

    /// One-line help text describing the `-X` options of this backend.
    #[must_use]
    pub fn option_help(&self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => {
                "gzip options:\n\
                 \x20 level=<1..9>    Compression level (default 9).\n\
                 \x20 window=<8..15>  Deflate window size (default 15)."
            }
            #[cfg(feature = "lzma")]
            Self::Xz { .. } => {
                "xz options:\n\
                 \x20 dictsize=<bytes>  LZMA2 dictionary size (default: block size)."
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 { .. } => {
                "lz4 options:\n\
                 \x20 hc  Use the slower high-compression mode."
            }
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => {
                "zstd options:\n\
                 \x20 level=<1..22>  Compression level (default 15)."
            }
        }
    }

    /// Apply a comma-separated `-X` option string.
    pub fn parse_extra(&mut self, extra: &str) -> Result<()> {
        for opt in extra.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = opt.split_once('=').unwrap_or((opt, ""));
            self.apply_option(key, value)
                .ok_or_else(|| ErrorInner::InvalidOption(format!("{} '{opt}'", self.name())))?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Option<()> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { level, window } => match key {
                "level" => *level = value.parse().ok().filter(|l| (1..=9).contains(l))?,
                "window" => *window = value.parse().ok().filter(|w| (8..=15).contains(w))?,
                _ => return None,
            },
            #[cfg(feature = "lzma")]
            Self::Xz { dict_size } => match key {
                "dictsize" => *dict_size = value.parse().ok().filter(|&d| d >= 4096)?,
                _ => return None,
            },
            #[cfg(feature = "lz4")]
            Self::Lz4 { high_compression } => match key {
                "hc" if value.is_empty() => *high_compression = true,
                _ => return None,
            },
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => match key {
                "level" => *level = value.parse().ok().filter(|l| (1..=22).contains(l))?,
                _ => return None,
            },
        }
        Some(())
    }

    /// Compress `src`, returning `None` when the result would not be
    /// strictly smaller (the caller then stores the block uncompressed).
    pub fn compress(&self, src: &[u8]) -> Result<Option<Vec<u8>>> {
        if src.is_empty() {
            return Ok(None);
        }
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { level, .. } => {
                use std::io::Write;

                let enc = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(src.len()),
                    flate2::Compression::new(*level),
                );
                let out = (|| {
                    let mut enc = enc;
                    enc.write_all(src)?;
                    enc.finish()
                })()
                .map_err(ErrorInner::Compress)?;
                Ok(Some(out).filter(|out| out.len() < src.len()))
            }
            #[cfg(feature = "lzma")]
            Self::Xz { dict_size } => {
                use xz2::stream::{Action, Check, Error, Filters, LzmaOptions, Status, Stream};

                let as_io = |err: Error| ErrorInner::Compress(std::io::Error::other(err));
                let mut opts = LzmaOptions::new_preset(6).map_err(as_io)?;
                opts.dict_size(*dict_size);
                let mut filters = Filters::new();
                filters.lzma2(&opts);
                let mut stream =
                    Stream::new_stream_encoder(&filters, Check::Crc32).map_err(as_io)?;

                let mut out = vec![0u8; src.len() - 1];
                Ok(match stream.process(src, &mut out, Action::Finish) {
                    Ok(Status::StreamEnd) => {
                        out.truncate(stream.total_out() as usize);
                        Some(out)
                    }
                    // Did not fit into less than the input size.
                    Ok(_) => None,
                    Err(err) => bail!(as_io(err)),
                })
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 { high_compression } => {
                use lz4::block::{CompressionMode, compress_to_buffer};

                let mode = high_compression.then_some(CompressionMode::HIGHCOMPRESSION(9));
                let mut out = vec![0u8; src.len() - 1];
                Ok(match compress_to_buffer(src, mode, false, &mut out) {
                    Ok(n) => {
                        out.truncate(n);
                        Some(out)
                    }
                    // The only failure mode with valid parameters is an
                    // output buffer too small for the compressed data.
                    Err(_) => None,
                })
            }
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => {
                let mut out = vec![0u8; src.len() - 1];
                Ok(match zstd::bulk::compress_to_buffer(src, &mut out, *level) {
                    Ok(n) => {
                        out.truncate(n);
                        Some(out)
                    }
                    Err(_) => None,
                })
            }
        }
    }

    /// Decompress `src` into a buffer of at most `size_limit` bytes.
    pub fn decompress(&self, src: &[u8], size_limit: usize) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => {
                use std::io::Read;

                let mut out = Vec::with_capacity(size_limit.min(1 << 20));
                flate2::read::ZlibDecoder::new(src)
                    .take(size_limit as u64)
                    .read_to_end(&mut out)
                    .map_err(ErrorInner::Compress)?;
                Ok(out)
            }
            #[cfg(feature = "lzma")]
            Self::Xz { .. } => {
                use xz2::stream::{Action, Status, Stream};

                let mut out = vec![0u8; size_limit];
                let (n, st) = (|| {
                    let mut stream = Stream::new_stream_decoder(u64::MAX, 0)?;
                    let st = stream.process(src, &mut out, Action::Run)?;
                    Ok((stream.total_out() as usize, st))
                })()
                .map_err(|err: xz2::stream::Error| {
                    ErrorInner::Compress(std::io::Error::other(err))
                })?;
                if st != Status::StreamEnd {
                    bail!(ErrorInner::Compress(std::io::Error::other(
                        "xz stream did not end cleanly"
                    )));
                }
                out.truncate(n);
                Ok(out)
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 { .. } => {
                let mut out = vec![0u8; size_limit];
                let n = lz4::block::decompress_to_buffer(src, Some(size_limit as i32), &mut out)
                    .map_err(ErrorInner::Compress)?;
                out.truncate(n);
                Ok(out)
            }
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => {
                let mut out = vec![0u8; size_limit];
                let n = zstd::bulk::decompress_to_buffer(src, &mut out)
                    .map_err(ErrorInner::Compress)?;
                out.truncate(n);
                Ok(out)
            }
        }
    }

    /// The body of the compressor-options block following the superblock,
    /// or `None` when the backend's defaults are in effect and no block is
    /// needed. LZ4 always writes one; the format requires it.
    #[must_use]
    pub fn options_payload(&self) -> Option<Vec<u8>> {
        #[derive(IntoBytes, Immutable)]
        #[repr(C)]
        struct GzipOptions {
            level: le::U32,
            window: le::U16,
            strategies: le::U16,
        }
        #[derive(IntoBytes, Immutable)]
        #[repr(C)]
        struct XzOptions {
            dict_size: le::U32,
            filters: le::U32,
        }
        #[derive(IntoBytes, Immutable)]
        #[repr(C)]
        struct Lz4Options {
            version: le::U32,
            flags: le::U32,
        }

        match *self {
            #[cfg(feature = "gzip")]
            Self::Gzip { level, window } => {
                (level != GZIP_DEFAULT_LEVEL || window != GZIP_DEFAULT_WINDOW).then(|| {
                    GzipOptions {
                        level: le::U32::new(level),
                        window: le::U16::new(window),
                        strategies: le::U16::new(0),
                    }
                    .as_bytes()
                    .to_vec()
                })
            }
            #[cfg(feature = "lzma")]
            Self::Xz { dict_size } => Some(
                XzOptions {
                    dict_size: le::U32::new(dict_size),
                    filters: le::U32::new(0),
                }
                .as_bytes()
                .to_vec(),
            ),
            #[cfg(feature = "lz4")]
            Self::Lz4 { high_compression } => Some(
                Lz4Options {
                    version: le::U32::new(1),
                    flags: le::U32::new(u32::from(high_compression)),
                }
                .as_bytes()
                .to_vec(),
            ),
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => (level != ZSTD_DEFAULT_LEVEL)
                .then(|| le::U32::new(level as u32).as_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_round_trip() {
        let cmp = Compressor::by_name("gzip", 1 << 17).unwrap();
        let data = b"hello hello hello hello hello hello hello hello".repeat(32);
        let packed = cmp.compress(&data).unwrap().expect("compressible");
        assert!(packed.len() < data.len());
        assert_eq!(cmp.decompress(&packed, data.len()).unwrap(), data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn incompressible_input_is_stored_raw() {
        let cmp = Compressor::default_compressor(1 << 17);
        // Too short for any deflate header to pay off.
        assert!(cmp.compress(b"x").unwrap().is_none());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_round_trip() {
        let mut cmp = Compressor::by_name("zstd", 1 << 17).unwrap();
        cmp.parse_extra("level=3").unwrap();
        let data = vec![7u8; 1 << 16];
        let packed = cmp.compress(&data).unwrap().expect("compressible");
        assert_eq!(cmp.decompress(&packed, data.len()).unwrap(), data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn option_parsing() {
        let mut cmp = Compressor::by_name("gzip", 1 << 17).unwrap();
        assert!(cmp.options_payload().is_none());
        cmp.parse_extra("level=3,window=12").unwrap();
        match &cmp {
            Compressor::Gzip { level, window } => assert_eq!((*level, *window), (3, 12)),
            #[allow(unreachable_patterns)]
            _ => unreachable!(),
        }
        assert_eq!(cmp.options_payload().unwrap().len(), 8);
        assert!(cmp.parse_extra("level=42").is_err());
        assert!(cmp.parse_extra("nonsense").is_err());
    }

    #[test]
    fn unknown_compressor_name() {
        assert!(Compressor::by_name("lzo", 1 << 17).is_err());
    }
}
