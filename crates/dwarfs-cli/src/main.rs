//! dwarfsck: inspect DwarFS images.
//!
//! Usage:
//!   dwarfsck image.dwarfs info --detail 3
//!   dwarfsck image.dwarfs ls --long
//!   dwarfsck image.dwarfs cat path/to/file --offset 100 --size 20
//!   dwarfsck --perfmon filesystem_v2,block_cache image.dwarfs ls --data-order
//!
//! Set `RUST_LOG` to adjust tracing output (default `info`, on stderr).

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

use dwarfs_reader::{
    BlockAccessLevel, DirEntryRef, Filesystem, FilesystemOptions, FsInfoFeatures, FsInfoOptions,
    ImageOffset, Level, Logger, OsAccessGeneric, PerformanceMonitor, ReadlinkMode,
};

/// Inspect, list and extract from DwarFS images.
#[derive(Parser, Debug)]
#[command(name = "dwarfsck")]
#[command(about = "Inspect, list and extract from DwarFS images")]
struct Args {
    /// Reader options file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Image offset: `auto` or a byte offset
    #[arg(long)]
    image_offset: Option<ImageOffset>,

    /// Threads serving asynchronous block fetches
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Decompressed blocks kept in memory
    #[arg(long)]
    max_cached_blocks: Option<usize>,

    /// Added to reported inode numbers
    #[arg(long)]
    inode_offset: Option<u64>,

    /// Report every link count as 1
    #[arg(long)]
    no_nlink: bool,

    /// Skip structural metadata checks at mount
    #[arg(long)]
    no_consistency_check: bool,

    /// Reader log threshold (fatal, error, warn, info, verbose, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: Level,

    /// Comma separated performance monitor components
    #[arg(long, value_delimiter = ',')]
    perfmon: Vec<String>,

    /// Image file
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe the image
    Info {
        /// Detail level, 0 to 6
        #[arg(long, default_value_t = 2)]
        detail: u32,

        /// Print the structured report as JSON
        #[arg(long)]
        json: bool,

        /// Explicit feature list, overrides --detail
        #[arg(long)]
        features: Option<FsInfoFeatures>,

        /// Do not touch block payloads at all
        #[arg(long, conflicts_with = "no_verify")]
        no_check: bool,

        /// Decompress blocks but skip checksum verification
        #[arg(long)]
        no_verify: bool,
    },
    /// List every entry
    Ls {
        /// Order by data position instead of by path
        #[arg(long)]
        data_order: bool,

        /// Show mode, size and link target
        #[arg(short, long)]
        long: bool,

        /// List only the immediate children of this directory
        #[arg(long, conflicts_with = "data_order")]
        dir: Option<String>,
    },
    /// Write file contents to stdout
    Cat {
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Bytes to read, defaults to the rest of the file
        #[arg(long)]
        size: Option<usize>,
    },
    /// Show inode attributes
    Stat { path: String },
    /// Show a symlink target
    Readlink {
        path: String,

        #[arg(long, default_value = "raw")]
        mode: ReadlinkMode,
    },
    /// Print build history as JSON
    History,
    /// Print the full metadata as JSON
    Metadata,
    /// Show volume statistics
    Statvfs,
}

fn options(args: &Args) -> Result<FilesystemOptions> {
    let mut options = match &args.config {
        Some(path) => FilesystemOptions::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => FilesystemOptions::default(),
    };
    if let Some(offset) = args.image_offset {
        options = options.with_image_offset(offset);
    }
    if let Some(n) = args.worker_threads {
        options = options.with_worker_threads(n);
    }
    if let Some(n) = args.max_cached_blocks {
        options = options.with_max_cached_blocks(n);
    }
    if let Some(offset) = args.inode_offset {
        options = options.with_inode_offset(offset);
    }
    if args.no_nlink {
        options = options.with_enable_nlink(false);
    }
    if args.no_consistency_check {
        options = options.with_check_consistency(false);
    }
    debug!(?options, "reader options");
    Ok(options)
}

fn print_entry(fs: &Filesystem, out: &mut impl Write, entry: &DirEntryRef, long: bool) -> Result<()> {
    let path = if entry.is_root() { "/".to_string() } else { entry.unix_path()? };
    if !long {
        writeln!(out, "{path}")?;
        return Ok(());
    }
    let inode = entry.inode();
    let st = fs.getattr(inode.inode_num())?;
    write!(
        out,
        "{} {:>5}/{:<5} {:>10} {path}",
        inode.mode_string(),
        inode.uid(),
        inode.gid(),
        st.size
    )?;
    if inode.is_symlink() {
        write!(out, " -> {}", fs.readlink(inode.inode_num(), ReadlinkMode::Raw)?)?;
    }
    writeln!(out)?;
    Ok(())
}

fn run(fs: &Filesystem, command: &Command) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Info {
            detail,
            json,
            features,
            no_check,
            no_verify,
        } => {
            let block_access = if *no_check {
                BlockAccessLevel::NoAccess
            } else if *no_verify {
                BlockAccessLevel::NoVerify
            } else {
                BlockAccessLevel::Unrestricted
            };
            let options = FsInfoOptions {
                features: features.unwrap_or_else(|| FsInfoFeatures::for_level(*detail)),
                block_access,
            };
            if *json {
                let info = fs.info(&options)?;
                writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
            } else {
                out.write_all(fs.dump(&options)?.as_bytes())?;
            }
        }
        Command::Ls {
            dir: Some(dir),
            long,
            ..
        } => {
            for entry in fs.list_dir(dir)? {
                print_entry(fs, &mut out, &entry, *long)?;
            }
        }
        Command::Ls {
            data_order, long, ..
        } => {
            let visit = |entry: &DirEntryRef| print_entry(fs, &mut out, entry, *long);
            let walked = if *data_order {
                fs.walk_data_order(visit)
            } else {
                fs.walk(visit)
            };
            walked.map_err(|e| match e {
                dwarfs_reader::WalkError::Fs(e) => anyhow::Error::new(e),
                dwarfs_reader::WalkError::VisitorAborted(e) => e,
            })?;
        }
        Command::Cat { path, offset, size } => {
            let entry = fs.resolve(path)?;
            let inode = fs.open_inode(entry.inode_num())?;
            let data = fs.read(inode, size.unwrap_or(usize::MAX), *offset)?;
            out.write_all(&data)?;
        }
        Command::Stat { path } => {
            let entry = fs.resolve(path)?;
            let st = fs.getattr(entry.inode_num())?;
            writeln!(out, "{st}")?;
            writeln!(
                out,
                "ino={} nlink={} uid={} gid={} rdev={} blksize={} blocks={}",
                st.ino, st.nlink, st.uid, st.gid, st.rdev, st.blksize, st.blocks
            )?;
        }
        Command::Readlink { path, mode } => {
            let entry = fs.resolve(path)?;
            writeln!(out, "{}", fs.readlink(entry.inode_num(), *mode)?)?;
        }
        Command::History => match fs.get_history()? {
            Some(history) => writeln!(out, "{}", serde_json::to_string_pretty(&history)?)?,
            None => bail!("image has no history"),
        },
        Command::Metadata => {
            writeln!(out, "{}", serde_json::to_string_pretty(&fs.get_metadata()?)?)?;
        }
        Command::Statvfs => {
            writeln!(out, "{}", fs.statvfs()?)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let options = options(&args)?;

    let perfmon = (!args.perfmon.is_empty())
        .then(|| PerformanceMonitor::create(args.perfmon.iter().map(|s| s.trim().to_string())));

    debug!(image = %args.image.display(), "opening image");
    let fs = Filesystem::open_with_options(
        Logger::tracing(args.log_level),
        &OsAccessGeneric::new(),
        &args.image,
        perfmon.as_ref().map(Arc::clone),
        options,
    )
    .with_context(|| format!("opening {}", args.image.display()))?;

    let result = fs.scoped(|fs| run(fs, &args.command));

    if let Some(pm) = &perfmon {
        eprint!("{}", pm.summary());
    }
    result
}
