//! Logical-to-band address translation.

use std::iter::FusedIterator;
use std::num::NonZeroU64;

/// A contiguous run of bytes inside a single band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSegment {
    /// Index of the band, which also names its file.
    pub band: u64,
    /// Offset of the run within the band, always less than the band size.
    pub offset: u64,
    /// Length of the run, never zero.
    pub len: u64,
}

/// Iterator over the band segments covering an already clipped logical range.
///
/// Segments are yielded in increasing band order, each starting where the
/// previous one ended, and their lengths sum to the clipped length.
#[derive(Debug, Clone)]
pub struct Bands {
    band_size: NonZeroU64,
    position: u64,
    remaining: u64,
}

impl Bands {
    pub(crate) fn new(band_size: NonZeroU64, offset: u64, len: u64) -> Bands {
        Bands {
            band_size,
            position: offset,
            remaining: len,
        }
    }

    /// Bytes not yet covered by a yielded segment.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for Bands {
    type Item = BandSegment;

    fn next(&mut self) -> Option<BandSegment> {
        if self.remaining == 0 {
            return None;
        }

        let band_size = self.band_size.get();
        let band = self.position / band_size;
        let offset = self.position % band_size;
        let len = self.remaining.min(band_size - offset);

        self.position += len;
        self.remaining -= len;

        Some(BandSegment { band, offset, len })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.remaining == 0 {
            return (0, Some(0));
        }

        let band_size = self.band_size.get();
        let first = self.position / band_size;
        let last = (self.position + self.remaining - 1) / band_size;
        let count = usize::try_from(last - first + 1).unwrap_or(usize::MAX);
        (count, Some(count))
    }
}

impl FusedIterator for Bands {}

#[cfg(test)]
mod tests {
    use crate::Bundle;

    use super::*;

    fn segments(band_size: u64, size: u64, offset: u64, length: u64) -> Vec<BandSegment> {
        Bundle::new("x", band_size, size)
            .unwrap()
            .bands(offset, length)
            .collect()
    }

    #[test]
    fn spans_two_bands() {
        assert_eq!(
            segments(8388608, 20000000, 8388600, 20),
            vec![
                BandSegment {
                    band: 0,
                    offset: 8388600,
                    len: 8,
                },
                BandSegment {
                    band: 1,
                    offset: 0,
                    len: 12,
                },
            ]
        );
    }

    #[test]
    fn past_end_is_empty() {
        assert!(segments(8, 100, 150, 10).is_empty());
        assert!(segments(8, 100, 100, 10).is_empty());
        assert!(segments(8, 100, 0, 0).is_empty());
    }

    #[test]
    fn clipped_at_end() {
        let segs = segments(64, 100, 90, 50);
        assert_eq!(
            segs,
            vec![BandSegment {
                band: 1,
                offset: 26,
                len: 10,
            }]
        );
    }

    #[test]
    fn segment_invariants_hold() {
        let cases = [
            (1, 10, 0, 10),
            (3, 100, 1, 97),
            (7, 50, 13, 1000),
            (8, 64, 8, 16),
            (4096, 1 << 20, 4095, 8193),
            (10, 10, 9, 1),
        ];

        for &(band_size, size, offset, length) in &cases {
            let bundle = Bundle::new("x", band_size, size).unwrap();
            let bands = bundle.bands(offset, length);
            let (hint, _) = bands.size_hint();
            let segs: Vec<_> = bands.collect();
            assert_eq!(hint, segs.len());

            let expected = bundle.clipped_len(offset, length);
            assert_eq!(segs.iter().map(|s| s.len).sum::<u64>(), expected);

            let mut position = offset;
            for seg in &segs {
                assert!(seg.len > 0);
                assert!(seg.offset + seg.len <= band_size);
                assert_eq!(seg.band * band_size + seg.offset, position);
                position += seg.len;
            }
        }
    }

    #[test]
    fn remaining_tracks_progress() {
        let bundle = Bundle::new("x", 4, 16).unwrap();
        let mut bands = bundle.bands(2, 10);
        assert_eq!(bands.remaining(), 10);
        bands.next();
        assert_eq!(bands.remaining(), 8);
        bands.by_ref().for_each(drop);
        assert_eq!(bands.remaining(), 0);
        assert_eq!(bands.next(), None);
    }
}
