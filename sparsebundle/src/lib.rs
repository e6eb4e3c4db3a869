//! Read-only access to sparse bundle disk images.
//!
//! A sparse bundle stores a large logical volume as a directory of
//! fixed-size band files under `bands/`, named by the band index in
//! lowercase hexadecimal. Bands that were never written have no file, and
//! bands that were never fully extended are shorter than the band size.
//! Both cases read as zeroes.
//!
//! [`Bundle`] describes the image, [`translate::Bands`] splits a logical
//! read into per-band segments, and the two [`ReadExecutor`]s turn those
//! segments into bytes: [`CopyReader`] by copying into a buffer and
//! [`ScatterReader`] by describing the result as a list of
//! `(descriptor, offset, length)` segments backed by a shared
//! [`DescriptorCache`].

mod bundle;
pub mod cache;
pub mod lifecycle;
pub mod plist;
pub mod read;
pub mod translate;

pub use bundle::{Bundle, BundleError};
pub use cache::{CacheConfig, DescriptorCache};
pub use lifecycle::OpenLifecycle;
pub use read::{CopyReader, DeliverySegment, ReadError, ReadExecutor, ScatterReader, SourceKind};
pub use translate::{BandSegment, Bands};
