//! Read an uncompressed tar archive from standard input and turn it into
//! a SquashFS 4.0 image.
use std::fmt;
use std::io::{self, Read};
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bstr::{BString, ByteSlice};
use clap::Parser;
use zerocopy::IntoBytes;
use zerocopy::little_endian as le;

use sqfs::compress::Compressor;
use sqfs::data::{DataWriter, Stats};
use sqfs::file::OutputFile;
use sqfs::format::{self, Flags, SuperBlock};
use sqfs::id_table::IdTable;
use sqfs::xattr::XattrTable;

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod fstree;
mod serialize;
mod tar;

use fstree::{Defaults, FsTree, NodeAttrs, Payload, TreeError, file_payload};
use tar::{EntryKind, TarReader};

#[derive(Debug, Parser)]
#[command(
    name = "tar2sqfs",
    version,
    about = "Read an uncompressed tar archive from stdin and turn it into a squashfs filesystem image",
    after_help = compressor_footer(),
)]
struct Cli {
    /// Select the compressor to use.
    #[arg(short, long)]
    compressor: Option<String>,

    /// Comma separated list of extra options for the selected compressor.
    /// Specify 'help' to get a list of available options.
    #[arg(short = 'X', long)]
    comp_extra: Option<String>,

    /// Number of compressor jobs to create.
    #[arg(short = 'j', long, default_value_t = 1)]
    num_jobs: usize,

    /// Maximum number of data blocks in the worker queue before the
    /// packer waits for the processors to catch up. Defaults to 10 times
    /// the number of jobs.
    #[arg(short = 'Q', long)]
    queue_backlog: Option<usize>,

    /// Block size to use for the squashfs image.
    #[arg(short, long, default_value_t = format::DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Device block size to pad the image to.
    #[arg(
        short = 'B',
        long,
        default_value_t = format::DEFAULT_DEV_BLOCK_SIZE,
        value_parser = clap::value_parser!(u32).range(i64::from(format::MIN_DEV_BLOCK_SIZE)..),
    )]
    dev_block_size: u32,

    /// Comma separated list of default values for implicitly created
    /// directories: uid=<value>, gid=<value>, mode=<value>, mtime=<value>.
    #[arg(short, long)]
    defaults: Option<String>,

    /// Abort if a tar record cannot be read instead of skipping it.
    #[arg(short = 's', long)]
    no_skip: bool,

    /// Do not copy extended attributes from the archive.
    #[arg(short = 'x', long)]
    no_xattr: bool,

    /// Keep the time stamps stored in the archive instead of setting
    /// defaults on all files.
    #[arg(short = 'k', long)]
    keep_time: bool,

    /// Generate an export table for NFS support.
    #[arg(short, long)]
    exportable: bool,

    /// Overwrite the output file if it exists.
    #[arg(short, long)]
    force: bool,

    /// Do not print out progress reports.
    #[arg(short, long)]
    quiet: bool,

    /// The squashfs image to create.
    output: Option<PathBuf>,
}

fn compressor_footer() -> String {
    format!(
        "Available compressors: {}",
        Compressor::available().join(", ")
    )
}

#[derive(Debug)]
enum Error {
    Tar(tar::Error),
    Sqfs(sqfs::Error),
    Tree(TreeError),
    Io(io::Error),
    Entry(BString, Box<Error>),
    Skipped(BString, &'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tar(err) => err.fmt(f),
            Self::Sqfs(err) => err.fmt(f),
            Self::Tree(err) => err.fmt(f),
            Self::Io(err) => err.fmt(f),
            Self::Entry(name, err) => write!(f, "{name}: {err}"),
            Self::Skipped(name, reason) => write!(f, "{name}: {reason}"),
        }
    }
}

impl From<tar::Error> for Error {
    #[cold]
    fn from(err: tar::Error) -> Self {
        Self::Tar(err)
    }
}

impl From<sqfs::Error> for Error {
    #[cold]
    fn from(err: sqfs::Error) -> Self {
        Self::Sqfs(err)
    }
}

impl From<TreeError> for Error {
    #[cold]
    fn from(err: TreeError) -> Self {
        Self::Tree(err)
    }
}

impl From<io::Error> for Error {
    #[cold]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let compressor = match build_compressor(&cli) {
        Ok(cmp) => cmp,
        Err(err) => {
            eprintln!("tar2sqfs: {err}");
            return ExitCode::FAILURE;
        }
    };
    if cli.comp_extra.as_deref() == Some("help") {
        println!("{}", compressor.option_help());
        return ExitCode::SUCCESS;
    }
    let Some(output) = cli.output.clone() else {
        eprintln!("tar2sqfs: missing argument: squashfs image");
        eprintln!("Try 'tar2sqfs --help' for more information.");
        return ExitCode::FAILURE;
    };

    match run(&cli, compressor, &output, &mut io::stdin().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tar2sqfs: {err}");
            ExitCode::FAILURE
        }
    }
}

fn build_compressor(cli: &Cli) -> Result<Compressor, Error> {
    let mut cmp = match &cli.compressor {
        Some(name) => Compressor::by_name(name, cli.block_size)?,
        None => Compressor::default_compressor(cli.block_size),
    };
    match cli.comp_extra.as_deref() {
        Some("help") | None => {}
        Some(extra) => cmp.parse_extra(extra)?,
    }
    Ok(cmp)
}

fn run(
    cli: &Cli,
    cmp: Compressor,
    output: &Path,
    input: &mut dyn Read,
) -> Result<(), Error> {
    let defaults = match &cli.defaults {
        Some(spec) => Defaults::parse(spec)?,
        None => Defaults::default(),
    };
    let num_jobs = NonZero::new(cli.num_jobs.max(1)).expect("clamped to at least one");
    let backlog = NonZero::new(cli.queue_backlog.unwrap_or(10 * num_jobs.get()).max(1))
        .expect("clamped to at least one");

    let mut sb = SuperBlock::new(cli.block_size, defaults.mtime, cmp.id())?;
    let mut file = OutputFile::create(output, cli.force)?;
    file.append(sb.as_bytes())?;

    if let Some(options) = cmp.options_payload() {
        let word = options.len() as u16 | format::META_BLOCK_UNCOMPRESSED;
        file.append(&word.to_le_bytes())?;
        file.append(&options)?;
        sb.set_flag(Flags::COMPRESSOR_OPTIONS);
    }

    let mut fs = FsTree::new(defaults);
    let mut data = DataWriter::new(file, cmp.clone(), cli.block_size, num_jobs, backlog)?;

    let mut reader = TarReader::new(input);
    process_tarball(&mut reader, &mut fs, &mut data, cli)?;

    let (mut file, files, frag_table, stats) = data.finish()?;

    fs.sort_recursive();
    fs.gen_inode_table();
    sb.inode_count = le::U32::new(fs.inode_count_field());
    fs.dedup_xattr()?;

    let mut idtbl = IdTable::new();
    serialize::serialize_fstree(&mut file, &mut sb, &mut fs, &files, &cmp, &mut idtbl)?;
    frag_table.write(&mut file, &mut sb, &cmp)?;
    if cli.exportable {
        serialize::write_export_table(&mut file, &mut sb, &fs, &cmp)?;
    }
    idtbl.write(&mut file, &mut sb, &cmp)?;
    if !cli.no_xattr {
        fs.xattrs.write(&mut file, &mut sb, &cmp)?;
    }

    sb.bytes_used = le::U64::new(file.get_size());
    file.write_at(0, sb.as_bytes())?;
    file.pad_to(cli.dev_block_size)?;

    if !cli.quiet {
        print_statistics(&stats, file.get_size());
    }
    Ok(())
}

fn process_tarball(
    reader: &mut TarReader<&mut dyn Read>,
    fs: &mut FsTree,
    data: &mut DataWriter,
    cli: &Cli,
) -> Result<(), Error> {
    while let Some(hdr) = reader.read_header()? {
        let canonical = tar::canonicalize_name(hdr.name.as_bstr());

        let skip_reason = if canonical.is_none() {
            Some("invalid name")
        } else if hdr.unknown_record {
            Some("unknown entry type")
        } else if canonical.as_ref().is_some_and(|n| n.is_empty())
            && hdr.kind != EntryKind::Directory
        {
            Some("non-directory entry for the root path")
        } else if let Some(map) = hdr.sparse.as_deref() {
            (!tar::validate_sparse_map(map, hdr.record_size, hdr.actual_size))
                .then_some("broken sparse file layout")
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            if cli.no_skip {
                bail!(Error::Skipped(hdr.name, reason));
            }
            eprintln!("skipping '{}' ({reason})", hdr.name);
            reader.skip_entry(hdr.record_size)?;
            continue;
        }
        let name = canonical.expect("checked above");

        let attrs = NodeAttrs {
            mode: hdr.mode,
            uid: hdr.uid,
            gid: hdr.gid,
            mtime: if cli.keep_time {
                hdr.mtime
            } else {
                fs.defaults.mtime
            },
        };
        let payload = match hdr.kind {
            EntryKind::Regular | EntryKind::HardLink => file_payload(hdr.actual_size),
            EntryKind::Symlink => {
                Payload::Symlink(hdr.link_target.clone().unwrap_or_default())
            }
            EntryKind::Directory => Payload::Dir {
                children: Vec::new(),
            },
            EntryKind::CharDev | EntryKind::BlockDev => {
                Payload::Device(format::encode_devno(hdr.devmajor, hdr.devminor))
            }
            EntryKind::Fifo => Payload::Ipc,
        };

        let node = fs
            .insert(name.as_bstr(), attrs, payload)
            .map_err(|err| Error::Entry(name.clone(), Box::new(err.into())))?;
        if !cli.quiet {
            println!("packing {name}");
        }

        if !cli.no_xattr {
            for (key, value) in &hdr.xattr {
                if !XattrTable::is_representable(key.as_bstr()) {
                    if cli.no_skip {
                        bail!(Error::Entry(
                            name.clone(),
                            Box::new(Error::Skipped(key.clone(), "unsupported xattr prefix")),
                        ));
                    }
                    eprintln!("WARNING: squashfs does not support xattr prefix of {key}");
                    continue;
                }
                fs.add_xattr(node, key.as_bstr(), value)?;
            }
        }

        match hdr.kind {
            EntryKind::Regular | EntryKind::HardLink => {
                // The validated map ends with the EOF marker; the writer
                // wants the data segments alone.
                let segments = hdr
                    .sparse
                    .as_deref()
                    .map(|map| &map[..map.len() - 1]);
                let id = data
                    .write_file(&mut reader.payload(hdr.record_size), hdr.actual_size, segments)
                    .map_err(|err| Error::Entry(name.clone(), Box::new(err.into())))?;
                if let Payload::File { data: slot, .. } = &mut fs.node_mut(node).payload {
                    *slot = Some(id);
                }
                reader.skip_padding(hdr.record_size)?;
            }
            _ if hdr.record_size > 0 => reader.skip_entry(hdr.record_size)?,
            _ => {}
        }
    }
    Ok(())
}

fn print_statistics(stats: &Stats, image_size: u64) {
    println!("input files processed: {}", stats.files);
    println!("data blocks written: {}", stats.blocks_written);
    println!("fragment blocks written: {}", stats.fragment_blocks_written);
    println!("bytes read: {}", stats.bytes_read);
    println!("bytes saved by deduplication: {}", stats.dedup_bytes);
    println!("bytes saved by sparse holes: {}", stats.sparse_bytes);
    println!("image size: {image_size}");
}
