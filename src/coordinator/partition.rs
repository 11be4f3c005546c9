//! Pure partition planning
//!
//! These functions decide how a dataset of length `L` is cut into contiguous
//! partitions for `W` workers. They perform no I/O and are deterministic.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, MapReduceError, MapReduceResult};
use crate::source::Partition;

/// How the partition length is derived from `L` and `W`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// `floor(L / W) + 1`; may produce fewer than `W` partitions
    #[default]
    FloorPlusOne,
    /// `ceil(L / W)`
    ExactCeil,
}

/// Pure: Size of every partition but possibly the last
///
/// # Examples
/// ```
/// use brokermr::coordinator::{partition_length, PartitionStrategy};
///
/// assert_eq!(partition_length(17, 4, PartitionStrategy::FloorPlusOne).unwrap(), 5);
/// assert_eq!(partition_length(16, 4, PartitionStrategy::FloorPlusOne).unwrap(), 5);
/// assert_eq!(partition_length(16, 4, PartitionStrategy::ExactCeil).unwrap(), 4);
/// ```
pub fn partition_length(
    length: u64,
    workers: u32,
    strategy: PartitionStrategy,
) -> MapReduceResult<u64> {
    if length == 0 {
        return Err(MapReduceError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_VALUE,
            "Cannot partition an empty dataset",
        ));
    }
    if workers == 0 {
        return Err(MapReduceError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_VALUE,
            "Worker count must be greater than 0",
        ));
    }

    let workers = u64::from(workers);
    Ok(match strategy {
        PartitionStrategy::FloorPlusOne => length / workers + 1,
        PartitionStrategy::ExactCeil => length.div_ceil(workers),
    })
}

/// Pure: Cut `[0, length)` into contiguous partitions in emission order
///
/// Every partition has the planned size except possibly the last, which is
/// smaller. The result is never empty for a valid input.
pub fn plan_partitions(
    length: u64,
    workers: u32,
    strategy: PartitionStrategy,
) -> MapReduceResult<Vec<Partition>> {
    let size = partition_length(length, workers, strategy)?;
    let count = length.div_ceil(size);

    Ok((0..count)
        .map(|i| {
            let offset = i * size;
            Partition::new(offset, size.min(length - offset))
        })
        .collect())
}
