//! In-memory collection source

use serde_json::Value;
use std::collections::BTreeMap;

use super::{DataSource, Partition, Record, Records};

/// Sliced view over materialized records
///
/// The held records occupy logical positions
/// `[base_offset, base_offset + records.len())` of a dataset of
/// `full_length` elements. A whole collection has `base_offset == 0`.
#[derive(Debug, Clone)]
pub struct CollectionSource {
    records: Vec<Record>,
    base_offset: u64,
    full_length: u64,
}

impl CollectionSource {
    /// Sequence of values keyed by position
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let records: Vec<Record> = values
            .into_iter()
            .enumerate()
            .map(|(position, value)| Record::positional(position as u64, value))
            .collect();
        let full_length = records.len() as u64;
        Self::positioned(records, 0, full_length)
    }

    /// Mapping iterated in key order
    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        let records: Vec<Record> = map
            .into_iter()
            .map(|(key, value)| Record::new(key, value))
            .collect();
        let full_length = records.len() as u64;
        Self::positioned(records, 0, full_length)
    }

    /// Records that start at `base_offset` within a larger dataset
    pub fn positioned(records: Vec<Record>, base_offset: u64, full_length: u64) -> Self {
        Self {
            records,
            base_offset,
            full_length,
        }
    }

    /// Range of positions the held records cover
    pub fn covered(&self) -> Partition {
        Partition::new(self.base_offset, self.records.len() as u64)
    }
}

impl DataSource for CollectionSource {
    fn iterate(&self, partition: Partition) -> Records<'_> {
        let range = partition.intersect(&self.covered());
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = (range.offset - self.base_offset) as usize;
        let end = start + range.limit as usize;
        Box::new(self.records[start..end].iter().cloned())
    }

    fn full_length(&self) -> u64 {
        self.full_length
    }
}
