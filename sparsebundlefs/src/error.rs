use std::path::PathBuf;

use miette::Diagnostic;
use sparsebundle::BundleError;
use sparsebundlefs::FsError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error("Cannot resolve sparse bundle `{}`", .path.display())]
    ResolveBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open sparse bundle `{}`", .path.display())]
    #[diagnostic(help("Is this a sparse bundle with `band-size` and `size` in its Info.plist?"))]
    OpenBundle {
        path: PathBuf,
        #[source]
        source: BundleError,
    },

    #[error("Cannot prepare filesystem for `{}`", .path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("Cannot mount at `{}`", .path.display())]
    #[diagnostic(help("Does the mount point exist, and is FUSE available?"))]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
