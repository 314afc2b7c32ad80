//! Mapping of a requested byte range onto aligned remote chunks.

use bytes::Bytes;
use serde::Serialize;

use super::StreamError;

/// Chunk-aligned plan for serving the inclusive byte range `[from, until]`.
///
/// Remote fetches must start on a multiple of the chunk size, so the first
/// chunk usually starts before `from` and the last one usually ends after
/// `until`. The cut points trim those two chunks back to the exact range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangePlan {
    /// Offset of the first chunk, aligned to `chunk_size`
    pub offset: u64,
    /// Bytes to drop from the front of the first chunk
    pub first_cut: usize,
    /// Bytes to keep from the last chunk
    pub last_cut: usize,
    /// Number of chunks to fetch
    pub part_count: u64,
    pub chunk_size: usize,
}

impl RangePlan {
    /// Plans the inclusive range `[from, until]` in chunks of `chunk_size`.
    ///
    /// # Errors
    /// - `StreamError::InvalidChunkSize` - `chunk_size` is zero
    /// - `StreamError::InvalidRange` - `from` lies after `until`, or `until`
    ///   has no representable end offset
    pub fn new(from: u64, until: u64, chunk_size: usize) -> Result<Self, StreamError> {
        if chunk_size == 0 {
            return Err(StreamError::InvalidChunkSize);
        }
        let end = match until.checked_add(1) {
            Some(end) if from <= until => end,
            _ => return Err(StreamError::InvalidRange { from, until }),
        };

        let chunk = chunk_size as u64;
        let offset = from - from % chunk;
        let first_cut = (from - offset) as usize;
        let last_cut = (until % chunk + 1) as usize;
        let part_count = end.div_ceil(chunk) - offset / chunk;

        Ok(Self {
            offset,
            first_cut,
            last_cut,
            part_count,
            chunk_size,
        })
    }

    /// Plan that fetches nothing. The resulting stream ends immediately.
    pub fn empty(chunk_size: usize) -> Self {
        Self {
            offset: 0,
            first_cut: 0,
            last_cut: 0,
            part_count: 0,
            chunk_size,
        }
    }

    /// Remote offset of chunk `sequence`.
    pub fn chunk_offset(&self, sequence: u64) -> u64 {
        self.offset + sequence * self.chunk_size as u64
    }

    /// Trims chunk `sequence` to the requested range.
    ///
    /// Cut points are clamped to the chunk length, so a short final chunk
    /// at the end of the object never panics.
    pub fn trim(&self, sequence: u64, chunk: Bytes) -> Bytes {
        let is_first = sequence == 0;
        let is_last = sequence + 1 == self.part_count;
        let len = chunk.len();

        let start = if is_first { self.first_cut.min(len) } else { 0 };
        let end = if is_last { self.last_cut.min(len) } else { len };

        if start == 0 && end == len {
            chunk
        } else if start >= end {
            Bytes::new()
        } else {
            chunk.slice(start..end)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_plan_unaligned_range() {
        let plan = RangePlan::new(1_000, 5_000, 1_024).unwrap();

        assert_eq!(plan.offset, 0);
        assert_eq!(plan.first_cut, 1_000);
        assert_eq!(plan.last_cut, 5_000 % 1_024 + 1);
        assert_eq!(plan.part_count, 5);
        assert_eq!(plan.chunk_offset(3), 3_072);
    }

    #[test]
    fn test_plan_single_part_cuts_both_ends() {
        let plan = RangePlan::new(10, 19, 64).unwrap();
        assert_eq!(plan.part_count, 1);

        let chunk = Bytes::from((0u8..64).collect::<Vec<_>>());
        let trimmed = plan.trim(0, chunk);
        assert_eq!(trimmed.as_ref(), (10u8..20).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_plan_rejects_reversed_range() {
        assert_eq!(
            RangePlan::new(10, 9, 64),
            Err(StreamError::InvalidRange { from: 10, until: 9 })
        );
        assert_eq!(RangePlan::new(0, 9, 0), Err(StreamError::InvalidChunkSize));
    }

    #[test]
    fn test_plan_rejects_open_ended_range() {
        assert_eq!(
            RangePlan::new(0, u64::MAX, 1_024),
            Err(StreamError::InvalidRange {
                from: 0,
                until: u64::MAX
            })
        );
    }

    #[test]
    fn test_trim_clamps_short_final_chunk() {
        let plan = RangePlan::new(0, 99, 64).unwrap();
        let short = Bytes::from_static(&[7u8; 20]);

        assert_eq!(plan.trim(1, short).len(), 20);
    }

    #[test]
    fn test_middle_chunks_are_untouched() {
        let plan = RangePlan::new(5, 300, 64).unwrap();
        let chunk = Bytes::from_static(&[1u8; 64]);

        assert_eq!(plan.trim(2, chunk.clone()), chunk);
    }

    proptest! {
        #[test]
        fn test_trimmed_chunks_cover_exact_range(
            from in 0u64..10_000,
            len in 1u64..10_000,
            chunk_size in 1usize..2_048,
        ) {
            let until = from + len - 1;
            let plan = RangePlan::new(from, until, chunk_size).unwrap();

            prop_assert_eq!(plan.offset % chunk_size as u64, 0);
            prop_assert!(plan.offset <= from);

            let source: Vec<u8> = (0..=until + chunk_size as u64)
                .map(|i| (i % 251) as u8)
                .collect();
            let mut delivered = Vec::new();
            for sequence in 0..plan.part_count {
                let start = plan.chunk_offset(sequence) as usize;
                let chunk = Bytes::copy_from_slice(&source[start..start + chunk_size]);
                delivered.extend_from_slice(&plan.trim(sequence, chunk));
            }

            prop_assert_eq!(delivered.as_slice(), &source[from as usize..=until as usize]);
        }
    }
}
