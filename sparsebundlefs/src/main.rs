mod error;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sparsebundle::{Bundle, CacheConfig};
use sparsebundlefs::{mount_option, FsOptions, MountOption, ReadMode, SparseBundleFs, IMAGE_NAME};

use error::{Error, Result};

#[derive(Debug, Parser)]
#[command(
    name = "sparsebundlefs",
    about = "Mount a sparse bundle disk image as a read-only FUSE filesystem"
)]
struct Options {
    /// Path to the .sparsebundle directory
    sparsebundle: PathBuf,

    /// Mount point directory
    mountpoint: PathBuf,

    /// Additional mount options, comma separated (e.g. allow_other)
    #[arg(short = 'o', long = "options", value_delimiter = ',')]
    options: Vec<String>,

    /// Enable debug logging
    #[arg(short = 'D', long)]
    debug: bool,

    /// Serve reads through cached band descriptors instead of per-read copies
    #[arg(long)]
    scatter: bool,

    /// Number of read worker threads
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> miette::Result<()> {
    let opts = Options::parse();

    let default_filter = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    run(opts)?;
    Ok(())
}

fn run(opts: Options) -> Result<()> {
    let path = std::fs::canonicalize(&opts.sparsebundle).map_err(|source| Error::ResolveBundle {
        path: opts.sparsebundle.clone(),
        source,
    })?;

    let bundle = Bundle::open(&path).map_err(|source| Error::OpenBundle {
        path: path.clone(),
        source,
    })?;

    tracing::info!(
        path = %path.display(),
        band_size = bundle.band_size(),
        size = bundle.size(),
        "opened sparse bundle"
    );

    let options = FsOptions {
        mode: if opts.scatter {
            ReadMode::Scatter
        } else {
            ReadMode::Copy
        },
        cache: CacheConfig::from_rlimit(),
        threads: opts.threads,
    };

    let fs = SparseBundleFs::new(bundle, options).map_err(|source| Error::Setup {
        path: path.clone(),
        source,
    })?;

    let mut mount_opts = vec![
        MountOption::RO,
        MountOption::FSName(path.to_string_lossy().to_string()),
    ];
    mount_opts.extend(opts.options.iter().filter_map(|o| mount_option(o)));

    tracing::info!(
        mountpoint = %opts.mountpoint.display(),
        image = IMAGE_NAME,
        "mounting"
    );

    fuser::mount2(fs, &opts.mountpoint, &mount_opts).map_err(|source| Error::Mount {
        path: opts.mountpoint.clone(),
        source,
    })
}
