//! Data sources over bounded logical sequences
//!
//! A [`DataSource`] iterates any contiguous [`Partition`] of its dataset and
//! reports the dataset's full length independently of the partition. Sources
//! are never shipped between processes; a [`SourceFactory`] is, and the
//! receiving process rebuilds the source from it.

pub mod collection;
pub mod factory;
pub mod range;
pub mod sql;

pub use collection::CollectionSource;
pub use factory::{SourceFactory, SourceSpec};
pub use range::{ArithmeticSource, ArithmeticSpec, Progression};
pub use sql::SqlSpec;
#[cfg(feature = "postgres")]
pub use sql::SqlSource;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One element of a dataset
///
/// Sequence sources key each element by its logical position; mapping
/// sources use the mapping key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Value,
    pub value: Value,
}

impl Record {
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Record keyed by its position in a sequence
    pub fn positional(position: u64, value: impl Into<Value>) -> Self {
        Self::new(position, value)
    }
}

/// Half-open range `[offset, offset + limit)` over a logical dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub offset: u64,
    pub limit: u64,
}

impl Partition {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Exclusive end position
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.limit)
    }

    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }

    /// Shrink the range so it ends at or before `length`
    pub fn clamp_to(self, length: u64) -> Self {
        let offset = self.offset.min(length);
        Self {
            offset,
            limit: self.limit.min(length - offset),
        }
    }

    /// Overlap with another range, empty when they do not intersect
    pub fn intersect(&self, other: &Partition) -> Partition {
        let offset = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        Partition {
            offset,
            limit: end.saturating_sub(offset),
        }
    }
}

/// Lazy, finite, non-restartable sequence of records
pub type Records<'a> = Box<dyn Iterator<Item = Record> + Send + 'a>;

/// Capability over a bounded logical sequence
pub trait DataSource: Send + Sync {
    /// Iterate the records of `partition`, clipped to the dataset
    fn iterate(&self, partition: Partition) -> Records<'_>;

    /// Logical dataset size, independent of any partition
    fn full_length(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_clamp() {
        assert_eq!(Partition::new(15, 5).clamp_to(17), Partition::new(15, 2));
        assert_eq!(Partition::new(20, 5).clamp_to(17), Partition::new(17, 0));
        assert_eq!(Partition::new(0, 5).clamp_to(17), Partition::new(0, 5));
    }

    #[test]
    fn test_partition_intersect() {
        let a = Partition::new(10, 10);
        assert_eq!(a.intersect(&Partition::new(15, 10)), Partition::new(15, 5));
        assert!(a.intersect(&Partition::new(30, 5)).is_empty());
    }

    #[test]
    fn test_positional_record() {
        let record = Record::positional(3, "x");
        assert_eq!(record.key, serde_json::json!(3));
        assert_eq!(record.value, serde_json::json!("x"));
    }
}
