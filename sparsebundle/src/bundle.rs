use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use crate::plist::{self, BundleInfo};
use crate::translate::Bands;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Could not read bundle metadata. Path: '{}'", .1.display())]
    ReadMetadata(#[source] std::io::Error, PathBuf),

    #[error("Bundle metadata does not contain `{0}`.")]
    MissingKey(&'static str),

    #[error("Invalid value for `{key}` in bundle metadata: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("Disk image too large to be mounted ({0} bytes)")]
    TooLarge(u64),

    #[error("Band size must be greater than zero.")]
    InvalidBandSize,
}

/// Immutable description of a sparse bundle: where it lives, how large each
/// band is and how large the logical image is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    path: PathBuf,
    band_size: NonZeroU64,
    size: u64,
}

impl Bundle {
    /// Largest size accepted for either the band size or the image size.
    /// Offsets are signed on the FUSE side, so anything past this is unaddressable.
    pub const MAX_SIZE: u64 = i64::MAX as u64;

    pub fn new<P: Into<PathBuf>>(path: P, band_size: u64, size: u64) -> Result<Bundle, BundleError> {
        let band_size = NonZeroU64::new(band_size).ok_or(BundleError::InvalidBandSize)?;
        if band_size.get() > Self::MAX_SIZE {
            return Err(BundleError::TooLarge(band_size.get()));
        }
        if size > Self::MAX_SIZE {
            return Err(BundleError::TooLarge(size));
        }

        Ok(Bundle {
            path: path.into(),
            band_size,
            size,
        })
    }

    /// Opens the bundle directory at `path`, scanning its `Info.plist` for the
    /// band size and the total image size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Bundle, BundleError> {
        let path = path.as_ref();
        let BundleInfo { band_size, size } = plist::read(path.join(plist::INFO_PLIST))?;
        let bundle = Bundle::new(path, band_size, size)?;

        tracing::debug!(
            path = %bundle.path.display(),
            band_size,
            size,
            "initialized sparse bundle"
        );

        Ok(bundle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn band_size(&self) -> u64 {
        self.band_size.get()
    }

    /// Logical size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the file backing `band`: `<path>/bands/<band in lowercase hex>`.
    pub fn band_path(&self, band: u64) -> PathBuf {
        self.path.join("bands").join(format!("{:x}", band))
    }

    /// Length of a read of `length` bytes at `offset` once clipped to the image.
    pub fn clipped_len(&self, offset: u64, length: u64) -> u64 {
        if offset >= self.size {
            0
        } else {
            length.min(self.size - offset)
        }
    }

    /// Splits a logical read into the band segments that cover it.
    pub fn bands(&self, offset: u64, length: u64) -> Bands {
        Bands::new(self.band_size, offset, self.clipped_len(offset, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_paths_are_unpadded_lowercase_hex() {
        let bundle = Bundle::new("/images/disk.sparsebundle", 8, 1024).unwrap();
        assert_eq!(
            bundle.band_path(0),
            Path::new("/images/disk.sparsebundle/bands/0")
        );
        assert_eq!(
            bundle.band_path(0xabc),
            Path::new("/images/disk.sparsebundle/bands/abc")
        );
        assert_eq!(
            bundle.band_path(16),
            Path::new("/images/disk.sparsebundle/bands/10")
        );
    }

    #[test]
    fn zero_band_size_is_rejected() {
        assert!(matches!(
            Bundle::new("x", 0, 100),
            Err(BundleError::InvalidBandSize)
        ));
    }

    #[test]
    fn oversized_image_is_rejected() {
        assert!(matches!(
            Bundle::new("x", 8, u64::MAX),
            Err(BundleError::TooLarge(u64::MAX))
        ));
        assert!(Bundle::new("x", 8, Bundle::MAX_SIZE).is_ok());
    }

    #[test]
    fn clipping() {
        let bundle = Bundle::new("x", 8, 100).unwrap();
        assert_eq!(bundle.clipped_len(150, 10), 0);
        assert_eq!(bundle.clipped_len(100, 10), 0);
        assert_eq!(bundle.clipped_len(90, 50), 10);
        assert_eq!(bundle.clipped_len(0, 20), 20);
        assert_eq!(bundle.clipped_len(99, u64::MAX), 1);
    }
}
