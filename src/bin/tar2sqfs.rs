use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tar2sqfs::{
    pack, Compressor, Config, Defaults, FilesystemCompressor, PackError,
};

/// Read an uncompressed tar archive from standard input and turn it into a
/// SquashFS image.
#[derive(Parser)]
#[command(author, version, name = "tar2sqfs", max_term_width = 98)]
struct Args {
    /// Output image file
    outfile: PathBuf,

    /// Compressor used for data and metadata blocks
    #[arg(short, long, default_value = "gzip", value_parser = parse_compressor)]
    compressor: Compressor,

    /// Comma separated compressor options, e.g. "level=9". "help" lists them
    #[arg(short = 'X', long = "comp-extra", value_name = "CSV")]
    comp_extra: Option<String>,

    /// Number of parallel compression jobs
    #[arg(short = 'j', long = "num-jobs", default_value_t = 1, value_name = "N")]
    num_jobs: usize,

    /// Maximum number of inflight data blocks. Defaults to 10 times the
    /// number of jobs
    #[arg(short = 'Q', long = "queue-backlog", value_name = "N")]
    queue_backlog: Option<usize>,

    /// Size of data blocks. Supports an optional K or M suffix
    #[arg(short, long, default_value = "128K", value_parser = parse_size)]
    block_size: u32,

    /// Device block size the image length is padded to. At least 1024
    #[arg(short = 'B', long = "dev-block-size", default_value = "4096", value_parser = parse_size)]
    dev_block_size: u32,

    /// Attributes of implied directories: "uid=<n>,gid=<n>,mode=<octal>,mtime=<n>"
    #[arg(short, long, value_parser = parse_defaults)]
    defaults: Option<Defaults>,

    /// Abort instead of skipping entries that cannot be decoded
    #[arg(short = 's', long = "no-skip")]
    no_skip: bool,

    /// Do not copy extended attributes into the image
    #[arg(short = 'x', long = "no-xattr")]
    no_xattr: bool,

    /// Keep the time stamps stored in the archive instead of the defaults
    #[arg(short, long)]
    keep_time: bool,

    /// Generate an NFS export table for lookup by inode number
    #[arg(short, long)]
    exportable: bool,

    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,

    /// Silence warnings
    #[arg(short, long)]
    quiet: bool,
}

fn parse_compressor(arg: &str) -> Result<Compressor, String> {
    Compressor::from_name(arg)
        .ok_or_else(|| "Possible values are: gzip, lzo, lz4, xz, zstd".to_string())
}

fn parse_size(arg: &str) -> Result<u32, String> {
    let multiplier = if arg.ends_with('K') {
        1024
    } else if arg.ends_with('M') {
        1024 * 1024
    } else {
        1
    };
    arg.trim_end_matches(['K', 'M'])
        .parse::<u32>()
        .map(|out| out * multiplier)
        .map_err(|e| e.to_string())
}

fn parse_defaults(arg: &str) -> Result<Defaults, String> {
    let mut defaults = Defaults::default();
    for part in arg.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got `{part}`"))?;
        match key {
            "uid" => defaults.uid = value.parse().map_err(|e| format!("uid: {e}"))?,
            "gid" => defaults.gid = value.parse().map_err(|e| format!("gid: {e}"))?,
            "mode" => {
                defaults.mode =
                    u16::from_str_radix(value, 8).map_err(|e| format!("mode: {e}"))?
            }
            "mtime" => defaults.mtime = value.parse().map_err(|e| format!("mtime: {e}"))?,
            _ => return Err(format!("unknown default `{key}`")),
        }
    }
    Ok(defaults)
}

fn run(args: Args) -> Result<(), PackError> {
    let options = args
        .comp_extra
        .as_deref()
        .map(|csv| FilesystemCompressor::parse_extra(args.compressor, csv))
        .transpose()?;
    let compressor = FilesystemCompressor::new(args.compressor, options)?;

    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true);
    if args.force {
        open_options.create(true).truncate(true);
    } else {
        open_options.create_new(true);
    }
    let file = open_options
        .open(&args.outfile)
        .map_err(PackError::OutputIo)?;

    let config = Config {
        compressor,
        block_size: args.block_size,
        dev_block_size: args.dev_block_size,
        num_jobs: args.num_jobs,
        max_backlog: args.queue_backlog.unwrap_or(0),
        defaults: args.defaults.unwrap_or_default(),
        strict: args.no_skip,
        no_xattr: args.no_xattr,
        keep_time: args.keep_time,
        exportable: args.exportable,
    };

    let stdin = io::stdin();
    pack(&config, stdin.lock(), Arc::new(file))?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.comp_extra.as_deref() == Some("help") {
        println!("{}", FilesystemCompressor::extra_help(args.compressor));
        return ExitCode::SUCCESS;
    }

    let filter = if args.quiet { "error" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let outfile = args.outfile.display().to_string();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tar2sqfs: {outfile}: {e}");
            ExitCode::FAILURE
        }
    }
}
