//! Read execution over translated band segments.
//!
//! Both executors consume the same [`Bands`](crate::Bands) translation and
//! must be indistinguishable to a caller: a missing band reads as zeroes and
//! a band shorter than the requested range is padded with zeroes.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::DescriptorCache;
use crate::translate::BandSegment;
use crate::Bundle;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Could not open band. Path: '{}'", .1.display())]
    OpenBand(#[source] io::Error, PathBuf),

    #[error("Could not read band. Path: '{}'", .1.display())]
    ReadBand(#[source] io::Error, PathBuf),

    #[error("Could not determine band length. Path: '{}'", .1.display())]
    StatBand(#[source] io::Error, PathBuf),

    #[error("Could not open zero source. Path: '{}'", .1.display())]
    ZeroSource(#[source] io::Error, PathBuf),

    #[error("Could not allocate buffers for a {0} byte read.")]
    OutOfMemory(u64),
}

impl ReadError {
    /// The errno to report for this failure.
    pub fn errno(&self) -> i32 {
        use ReadError::*;

        match self {
            OpenBand(e, _) | ReadBand(e, _) | StatBand(e, _) | ZeroSource(e, _) => {
                e.raw_os_error().unwrap_or(libc::EIO)
            }
            OutOfMemory(_) => libc::ENOMEM,
        }
    }
}

/// A strategy for turning a logical read into bytes.
pub trait ReadExecutor: Send + Sync {
    /// Reads up to `length` bytes at `offset`. The result is clipped to the
    /// image size and is empty at or past the end.
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ReadError>;
}

fn alloc_zeroed(len: u64) -> Result<Vec<u8>, ReadError> {
    let size = usize::try_from(len).map_err(|_| ReadError::OutOfMemory(len))?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| ReadError::OutOfMemory(len))?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Fills `buf` from `offset`, stopping early only at end of file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            // A signal, not a storage failure. Every other error is returned as is.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads bands straight into a caller buffer, opening each band file for
/// the duration of the segment.
#[derive(Debug, Clone)]
pub struct CopyReader {
    bundle: Arc<Bundle>,
}

impl CopyReader {
    pub fn new(bundle: Arc<Bundle>) -> CopyReader {
        CopyReader { bundle }
    }

    /// Reads `buf.len()` bytes at `offset` into `buf`, returning how many
    /// bytes were produced after clipping to the image. Bytes of `buf` past
    /// that count are left untouched.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReadError> {
        let mut written = 0;

        for segment in self.bundle.bands(offset, buf.len() as u64) {
            let len = segment.len as usize;
            self.copy_segment(&segment, &mut buf[written..written + len])?;
            written += len;
        }

        tracing::debug!(offset, requested = buf.len(), written, "copy read");
        Ok(written)
    }

    fn copy_segment(&self, segment: &BandSegment, dst: &mut [u8]) -> Result<(), ReadError> {
        let path = self.bundle.band_path(segment.band);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(band = segment.band, len = segment.len, "band missing, zero filling");
                dst.fill(0);
                return Ok(());
            }
            Err(e) => return Err(ReadError::OpenBand(e, path)),
        };

        let read = read_full_at(&file, dst, segment.offset).map_err(|e| ReadError::ReadBand(e, path))?;

        if read < dst.len() {
            tracing::trace!(
                band = segment.band,
                missing = dst.len() - read,
                "short band, padding with zeroes"
            );
            dst[read..].fill(0);
        }

        Ok(())
    }
}

impl ReadExecutor for CopyReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ReadError> {
        let mut buf = alloc_zeroed(self.bundle.clipped_len(offset, length))?;
        let written = self.read_into(offset, &mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Band(u64),
    Zero,
}

/// One piece of a scattered read: `len` bytes of `source` starting at `offset`.
#[derive(Debug, Clone)]
pub struct DeliverySegment {
    pub kind: SourceKind,
    pub source: Arc<File>,
    pub offset: u64,
    pub len: u64,
}

/// Describes reads as lists of descriptor ranges instead of copying bytes,
/// for dispatchers that can splice directly from file descriptors.
///
/// The bytes available in a band are taken from its length at scatter time.
/// If a band changes length before the segments are consumed, what gets
/// delivered for that band is undefined; the bundle is expected to stay
/// unmodified while mounted.
#[derive(Debug, Clone)]
pub struct ScatterReader {
    bundle: Arc<Bundle>,
    cache: Arc<DescriptorCache>,
}

impl ScatterReader {
    pub fn new(bundle: Arc<Bundle>, cache: Arc<DescriptorCache>) -> ScatterReader {
        ScatterReader { bundle, cache }
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    /// Builds the ordered segments whose concatenated contents are the bytes
    /// at `offset..offset + length`, clipped to the image.
    pub fn scatter(&self, offset: u64, length: u64) -> Result<Vec<DeliverySegment>, ReadError> {
        let bands = self.bundle.bands(offset, length);

        // A band can contribute a data segment and a padding segment.
        let mut segments = Vec::new();
        segments
            .try_reserve(bands.size_hint().0.saturating_mul(2))
            .map_err(|_| ReadError::OutOfMemory(bands.remaining()))?;

        for segment in bands {
            let path = self.bundle.band_path(segment.band);

            let file = match self.cache.acquire(&path) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    tracing::trace!(band = segment.band, len = segment.len, "band missing, zero source");
                    segments.push(self.zero_segment(segment.len)?);
                    continue;
                }
                Err(e) => return Err(ReadError::OpenBand(e, path)),
            };

            let band_len = file
                .metadata()
                .map_err(|e| ReadError::StatBand(e, path))?
                .len();
            let available = band_len.saturating_sub(segment.offset).min(segment.len);

            if available > 0 {
                segments.push(DeliverySegment {
                    kind: SourceKind::Band(segment.band),
                    source: file,
                    offset: segment.offset,
                    len: available,
                });
            }

            if available < segment.len {
                tracing::trace!(
                    band = segment.band,
                    missing = segment.len - available,
                    "short band, zero source"
                );
                segments.push(self.zero_segment(segment.len - available)?);
            }
        }

        tracing::debug!(offset, length, segments = segments.len(), "scatter read");
        Ok(segments)
    }

    fn zero_segment(&self, len: u64) -> Result<DeliverySegment, ReadError> {
        let source = self
            .cache
            .zero_source()
            .map_err(|e| ReadError::ZeroSource(e, self.cache.config().zero_source.clone()))?;

        Ok(DeliverySegment {
            kind: SourceKind::Zero,
            source,
            offset: 0,
            len,
        })
    }

    /// Performs the positioned reads a splicing dispatcher would perform,
    /// concatenating the segments into one buffer. A source that comes up
    /// short is padded with zeroes.
    pub fn gather(&self, segments: &[DeliverySegment]) -> Result<Vec<u8>, ReadError> {
        let total = segments.iter().map(|s| s.len).sum();
        let mut buf = alloc_zeroed(total)?;
        let mut written = 0;

        for segment in segments {
            let dst = &mut buf[written..written + segment.len as usize];
            let read = read_full_at(&segment.source, dst, segment.offset).map_err(|e| match segment.kind {
                SourceKind::Band(band) => ReadError::ReadBand(e, self.bundle.band_path(band)),
                SourceKind::Zero => ReadError::ZeroSource(e, self.cache.config().zero_source.clone()),
            })?;

            if read < dst.len() {
                tracing::warn!(
                    source = ?segment.kind,
                    expected = dst.len(),
                    read,
                    "source shrank after scatter, padding with zeroes"
                );
                dst[read..].fill(0);
            }

            written += dst.len();
        }

        Ok(buf)
    }
}

impl ReadExecutor for ScatterReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ReadError> {
        let segments = self.scatter(offset, length)?;
        self.gather(&segments)
    }
}
