//! Positional partitioning of a sorted work list into worker slices and
//! fixed-size chunks.
//!
//! Both functions are pure: the same sorted input and the same
//! `(workers, chunk_size)` always produce the same boundaries, which is what
//! lets a resumed step skip ranges recorded by an earlier attempt.

use std::ops::Range;

use crate::models::{ChunkRange, UserRange};

use super::WorkItem;

/// One chunk of a partition: its key range and its slice of the sorted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub range: ChunkRange,
    pub items: Range<usize>,
}

/// The chunks one worker processes, in ascending key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub index: usize,
    pub items: Range<usize>,
    pub chunks: Vec<ChunkPlan>,
}

/// Split `len` positions into `workers` contiguous slices of `ceil(len /
/// workers)` items. Trailing slices may be short or empty.
pub fn partition_bounds(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let per_worker = len.div_ceil(workers);
    (0..workers)
        .map(|index| {
            let start = (index * per_worker).min(len);
            let end = (start + per_worker).min(len);
            start..end
        })
        .collect()
}

/// Partition an already sorted list and chunk every partition by
/// `chunk_size`.
pub fn plan_partitions<T: WorkItem>(
    sorted: &[T],
    workers: usize,
    chunk_size: usize,
) -> Vec<PartitionPlan> {
    let chunk_size = chunk_size.max(1);
    partition_bounds(sorted.len(), workers)
        .into_iter()
        .enumerate()
        .map(|(index, items)| {
            let mut chunks = Vec::new();
            let mut start = items.start;
            while start < items.end {
                let end = (start + chunk_size).min(items.end);
                chunks.push(ChunkPlan {
                    range: ChunkRange::new(sorted[start].chunk_key(), sorted[end - 1].chunk_key()),
                    items: start..end,
                });
                start = end;
            }
            PartitionPlan {
                index,
                items,
                chunks,
            }
        })
        .collect()
}

/// Subject-id windows for the apply workers. `sorted_ids` must be ascending
/// and deduplicated; empty slices produce no window.
pub fn user_ranges(sorted_ids: &[i64], workers: usize) -> Vec<UserRange> {
    partition_bounds(sorted_ids.len(), workers)
        .into_iter()
        .filter(|bounds| !bounds.is_empty())
        .map(|bounds| UserRange {
            first: sorted_ids[bounds.start],
            last: sorted_ids[bounds.end - 1],
        })
        .collect()
}
