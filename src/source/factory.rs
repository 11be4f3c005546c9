//! Serializable data source descriptors
//!
//! A [`SourceFactory`] is what travels inside a partition request. It is
//! either *derived*, a source kind plus parameters plus a range that any
//! process can rebuild without receiving data, or *inline*, the materialized
//! records of one partition.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::collection::CollectionSource;
use super::range::{ArithmeticSource, ArithmeticSpec};
use super::sql::SqlSpec;
use super::{DataSource, Partition, Record};
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};

/// Source kinds that can be rebuilt from parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Arithmetic(ArithmeticSpec),
    Sql(SqlSpec),
}

impl SourceSpec {
    /// Length known from the parameters alone
    pub fn intrinsic_length(&self) -> Option<u64> {
        match self {
            Self::Arithmetic(spec) => Some(spec.length),
            Self::Sql(_) => None,
        }
    }

    pub fn validate(&self) -> MapReduceResult<()> {
        match self {
            Self::Arithmetic(spec) => spec.validate(),
            Self::Sql(spec) => spec.validate(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Arithmetic(_) => "arithmetic",
            Self::Sql(_) => "sql",
        }
    }
}

/// Descriptor that reconstructs a data source on a remote process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum SourceFactory {
    Derived {
        spec: SourceSpec,
        /// Range this factory covers; the whole dataset when absent
        #[serde(default)]
        partition: Option<Partition>,
        /// Dataset length for kinds without an intrinsic one
        #[serde(default)]
        declared_length: Option<u64>,
    },
    Inline {
        records: Vec<Record>,
        /// Logical position of the first record
        base_offset: u64,
        full_length: u64,
    },
}

impl SourceFactory {
    pub fn derived(spec: SourceSpec) -> Self {
        Self::Derived {
            spec,
            partition: None,
            declared_length: None,
        }
    }

    /// Inline sequence keyed by position
    pub fn inline(values: impl IntoIterator<Item = Value>) -> Self {
        let records: Vec<Record> = values
            .into_iter()
            .enumerate()
            .map(|(position, value)| Record::positional(position as u64, value))
            .collect();
        let full_length = records.len() as u64;
        Self::Inline {
            records,
            base_offset: 0,
            full_length,
        }
    }

    /// Inline mapping, iterated in key order
    pub fn inline_map(map: BTreeMap<String, Value>) -> Self {
        let records: Vec<Record> = map
            .into_iter()
            .map(|(key, value)| Record::new(key, value))
            .collect();
        let full_length = records.len() as u64;
        Self::Inline {
            records,
            base_offset: 0,
            full_length,
        }
    }

    /// Declare the dataset length of a derived factory; inline factories
    /// already carry theirs and are returned unchanged
    pub fn with_declared_length(self, length: u64) -> Self {
        match self {
            Self::Derived {
                spec, partition, ..
            } => Self::Derived {
                spec,
                partition,
                declared_length: Some(length),
            },
            inline @ Self::Inline { .. } => inline,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }

    /// Logical dataset length `L`
    pub fn length(&self) -> MapReduceResult<u64> {
        match self {
            Self::Derived {
                spec,
                declared_length,
                ..
            } => declared_length
                .or_else(|| spec.intrinsic_length())
                .ok_or_else(|| {
                    MapReduceError::configuration_with_code(
                        ErrorCode::CONFIG_LENGTH_UNDETERMINED,
                        format!(
                            "Impossible to determine the length of the {} source; declare it",
                            spec.kind()
                        ),
                    )
                }),
            Self::Inline { full_length, .. } => Ok(*full_length),
        }
    }

    /// Range this factory covers
    pub fn partition(&self) -> MapReduceResult<Partition> {
        match self {
            Self::Derived {
                partition: Some(partition),
                ..
            } => Ok(*partition),
            Self::Derived { .. } => Ok(Partition::new(0, self.length()?)),
            Self::Inline {
                records,
                base_offset,
                ..
            } => Ok(Partition::new(*base_offset, records.len() as u64)),
        }
    }

    /// Factory for `[offset, offset + limit)`, limit clamped to `L - offset`
    pub fn slice(&self, offset: u64, limit: u64) -> MapReduceResult<Self> {
        let length = self.length()?;
        if offset > length {
            return Err(out_of_range(offset, limit, length));
        }
        let wanted = Partition::new(offset, limit.min(length - offset));

        match self {
            Self::Derived {
                spec,
                declared_length,
                ..
            } => Ok(Self::Derived {
                spec: spec.clone(),
                partition: Some(wanted),
                declared_length: *declared_length,
            }),
            Self::Inline {
                records,
                base_offset,
                full_length,
            } => {
                let held = Partition::new(*base_offset, records.len() as u64);
                if wanted.offset < held.offset || wanted.end() > held.end() {
                    return Err(out_of_range(offset, limit, length));
                }
                let start = (wanted.offset - held.offset) as usize;
                let end = start + wanted.limit as usize;
                Ok(Self::Inline {
                    records: records[start..end].to_vec(),
                    base_offset: wanted.offset,
                    full_length: *full_length,
                })
            }
        }
    }

    /// Reconstruct the concrete data source
    pub async fn build(&self) -> MapReduceResult<Box<dyn DataSource>> {
        match self {
            Self::Derived {
                spec: SourceSpec::Arithmetic(spec),
                partition,
                ..
            } => {
                let source = ArithmeticSource::new(spec.clone())?;
                if let Some(partition) = partition {
                    if partition.end() > spec.length {
                        return Err(out_of_range(partition.offset, partition.limit, spec.length));
                    }
                }
                Ok(Box::new(source))
            }
            Self::Derived {
                spec: SourceSpec::Sql(spec),
                partition,
                declared_length,
            } => build_sql(spec, *partition, *declared_length).await,
            Self::Inline {
                records,
                base_offset,
                full_length,
            } => {
                if records.is_empty() {
                    return Err(MapReduceError::configuration_with_code(
                        ErrorCode::CONFIG_EMPTY_DATASET,
                        "Inline data source holds no records",
                    ));
                }
                let end = base_offset.checked_add(records.len() as u64);
                if end.map_or(true, |end| end > *full_length) {
                    return Err(MapReduceError::configuration_with_code(
                        ErrorCode::CONFIG_MALFORMED_SOURCE,
                        format!(
                            "Inline records of length {} at offset {} exceed the dataset length {}",
                            records.len(),
                            base_offset,
                            full_length
                        ),
                    ));
                }
                Ok(Box::new(CollectionSource::positioned(
                    records.clone(),
                    *base_offset,
                    *full_length,
                )))
            }
        }
    }
}

#[cfg(feature = "postgres")]
async fn build_sql(
    spec: &SqlSpec,
    partition: Option<Partition>,
    declared_length: Option<u64>,
) -> MapReduceResult<Box<dyn DataSource>> {
    let source = super::sql::SqlSource::fetch(spec, partition, declared_length).await?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "postgres"))]
async fn build_sql(
    spec: &SqlSpec,
    _partition: Option<Partition>,
    _declared_length: Option<u64>,
) -> MapReduceResult<Box<dyn DataSource>> {
    spec.validate()?;
    Err(MapReduceError::configuration_with_code(
        ErrorCode::CONFIG_FEATURE_DISABLED,
        "SQL data source not enabled. Enable with --features postgres",
    ))
}

fn out_of_range(offset: u64, limit: u64, length: u64) -> MapReduceError {
    MapReduceError::configuration_with_code(
        ErrorCode::CONFIG_PARTITION_OUT_OF_RANGE,
        format!(
            "Partition (offset {}, limit {}) lies outside the dataset of length {}",
            offset, limit, length
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(source: &dyn DataSource, partition: Partition) -> Vec<Value> {
        source.iterate(partition).map(|r| r.value).collect()
    }

    #[tokio::test]
    async fn test_inline_slice_iterates_the_slice() {
        let factory = SourceFactory::inline((0..999).map(Value::from));
        let sliced = factory.slice(300, 100).unwrap();

        assert_eq!(sliced.partition().unwrap(), Partition::new(300, 100));
        assert_eq!(sliced.length().unwrap(), 999);

        let source = sliced.build().await.unwrap();
        let got = values(source.as_ref(), sliced.partition().unwrap());
        let expected: Vec<Value> = (300..400).map(Value::from).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_derived_slice_keeps_parameters() {
        let factory = SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::integers(17)));
        let sliced = factory.slice(15, 5).unwrap();

        assert_eq!(sliced.partition().unwrap(), Partition::new(15, 2));
        let source = sliced.build().await.unwrap();
        assert_eq!(
            values(source.as_ref(), sliced.partition().unwrap()),
            vec![json!(15), json!(16)]
        );
        assert_eq!(source.full_length(), 17);
    }

    #[test]
    fn test_slice_offset_beyond_length() {
        let factory = SourceFactory::inline((0..10).map(Value::from));
        let err = factory.slice(11, 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_PARTITION_OUT_OF_RANGE);
    }

    #[test]
    fn test_reslicing_an_inline_slice() {
        let factory = SourceFactory::inline((0..100).map(Value::from));
        let outer = factory.slice(20, 30).unwrap();
        let inner = outer.slice(25, 10).unwrap();
        assert_eq!(inner.partition().unwrap(), Partition::new(25, 10));

        assert!(outer.slice(10, 5).is_err());
        assert!(outer.slice(60, 5).is_err());
    }

    #[tokio::test]
    async fn test_reslicing_past_the_held_records_fails() {
        let outer = SourceFactory::inline((0..100).map(Value::from))
            .slice(20, 30)
            .unwrap();

        let err = outer.slice(40, 20).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_PARTITION_OUT_OF_RANGE);

        let tail = outer.slice(40, 10).unwrap();
        let source = tail.build().await.unwrap();
        let expected: Vec<Value> = (40..50).map(Value::from).collect();
        assert_eq!(values(source.as_ref(), tail.partition().unwrap()), expected);
    }

    #[tokio::test]
    async fn test_inline_offset_overflow_is_malformed() {
        let factory = SourceFactory::Inline {
            records: vec![Record::positional(0, json!(1))],
            base_offset: u64::MAX,
            full_length: 5,
        };
        let err = factory.build().await.err().expect("build should fail");
        assert_eq!(err.code(), ErrorCode::CONFIG_MALFORMED_SOURCE);
    }

    #[test]
    fn test_sql_length_requires_declaration() {
        let spec = SourceSpec::Sql(SqlSpec {
            url: "postgres://localhost/db".to_string(),
            table: "items".to_string(),
            key_column: "id".to_string(),
            value_column: "payload".to_string(),
            order_by: None,
        });
        let factory = SourceFactory::derived(spec);
        let err = factory.length().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_LENGTH_UNDETERMINED);

        let factory = factory.with_declared_length(250);
        assert_eq!(factory.length().unwrap(), 250);
        assert_eq!(
            factory.slice(200, 100).unwrap().partition().unwrap(),
            Partition::new(200, 50)
        );
    }

    #[tokio::test]
    async fn test_empty_inline_fails_to_build() {
        let factory = SourceFactory::inline(Vec::<Value>::new());
        let err = factory.build().await.err().expect("build should fail");
        assert_eq!(err.code(), ErrorCode::CONFIG_EMPTY_DATASET);
    }

    #[tokio::test]
    async fn test_malformed_parameters_fail_to_build() {
        let factory =
            SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::floats(f64::INFINITY, 1.0, 4)));
        let err = factory.build().await.err().expect("build should fail");
        assert!(err.is_configuration());

        let sql = SourceFactory::derived(SourceSpec::Sql(SqlSpec {
            url: "postgres://localhost/db".to_string(),
            table: "items; --".to_string(),
            key_column: "id".to_string(),
            value_column: "payload".to_string(),
            order_by: None,
        }));
        let err = sql.build().await.err().expect("build should fail");
        assert_eq!(err.code(), ErrorCode::CONFIG_MALFORMED_SOURCE);
    }

    #[tokio::test]
    async fn test_inline_map_slices_in_key_order() {
        let mut map = BTreeMap::new();
        for (key, value) in [("delta", 4), ("alpha", 1), ("charlie", 3), ("bravo", 2)] {
            map.insert(key.to_string(), json!(value));
        }
        let factory = SourceFactory::inline_map(map).slice(1, 2).unwrap();
        let source = factory.build().await.unwrap();
        let keys: Vec<Value> = source
            .iterate(factory.partition().unwrap())
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![json!("bravo"), json!("charlie")]);
    }

    #[test]
    fn test_wire_shape() {
        let factory = SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::integers(5)))
            .slice(1, 2)
            .unwrap();
        let json = serde_json::to_value(&factory).unwrap();
        assert_eq!(json["variant"], "derived");
        assert_eq!(json["spec"]["kind"], "arithmetic");
        assert_eq!(json["partition"], json!({"offset": 1, "limit": 2}));

        let back: SourceFactory = serde_json::from_value(json).unwrap();
        assert_eq!(back, factory);
    }
}
