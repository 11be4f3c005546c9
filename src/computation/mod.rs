//! Map/reduce computations
//!
//! A [`Computation`] is a typed map/reduce pair. `reduce` runs once per
//! partition on a worker and once more on the coordinator over the partial
//! results, so it must accept its own outputs as input. Computations are
//! erased into [`DynComputation`] for the registry and the wire, where partial
//! results travel as JSON.

pub mod builtin;
pub mod registry;

pub use builtin::{IntegrateExp, SumOfSquares};
pub use registry::{Registry, RegisteredComputation, BUILTIN};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorCode, ErrorExt, MapReduceError, MapReduceResult};
use crate::source::{DataSource, Partition, Records};

/// Prefix of every computation's work queue
pub const ROUTING_PREFIX: &str = "brokermr";

/// Queue name for a computation identity
pub fn routing_key_for(name: &str) -> String {
    format!("{}.{}", ROUTING_PREFIX, name)
}

/// Lazy sequence of mapped values; an `Err` aborts the partition
pub type Mapped<'a, T> = Box<dyn Iterator<Item = MapReduceResult<T>> + 'a>;

/// Sequence of values handed to `reduce`
pub type Values<'a, T> = Box<dyn Iterator<Item = T> + 'a>;

/// A typed map/reduce pair
pub trait Computation: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Stable identity; names the work queue
    fn name(&self) -> &str;

    /// Map the records of one partition
    fn map<'a>(&'a self, records: Records<'a>) -> Mapped<'a, Self::Output>;

    /// Combine values into one
    fn reduce(&self, values: Values<'_, Self::Output>) -> MapReduceResult<Self::Output>;
}

/// Object-safe form of [`Computation`] exchanging JSON partial results
pub trait DynComputation: Send + Sync {
    fn name(&self) -> &str;

    fn routing_key(&self) -> String {
        routing_key_for(self.name())
    }

    /// Map and reduce one partition of `source`
    fn run_partition(&self, source: &dyn DataSource, partition: Partition)
        -> MapReduceResult<Value>;

    /// Final reduce over partial results in emission order
    fn reduce_partials(&self, partials: Vec<Value>) -> MapReduceResult<Value>;
}

impl<C: Computation> DynComputation for C {
    fn name(&self) -> &str {
        Computation::name(self)
    }

    fn run_partition(
        &self,
        source: &dyn DataSource,
        partition: Partition,
    ) -> MapReduceResult<Value> {
        let mut failure = None;
        let partial = {
            let mapped = self.map(source.iterate(partition)).map_while(|item| match item {
                Ok(value) => Some(value),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            });
            self.reduce(Box::new(mapped))
        };
        if let Some(err) = failure {
            return Err(with_computation(err, Computation::name(self)));
        }
        let partial = partial.map_err(|e| with_computation(e, Computation::name(self)))?;

        serde_json::to_value(partial).to_encode_error(format!(
            "Partial result of {} is not serializable",
            Computation::name(self)
        ))
    }

    fn reduce_partials(&self, partials: Vec<Value>) -> MapReduceResult<Value> {
        let values = partials
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value::<C::Output>(value).map_err(|e| {
                    MapReduceError::decode(format!(
                        "Partial result {} does not match the output of {}",
                        index,
                        Computation::name(self)
                    ))
                    .with_source(e)
                })
            })
            .collect::<MapReduceResult<Vec<_>>>()?;

        let result = self
            .reduce(Box::new(values.into_iter()))
            .map_err(|e| with_computation(e, Computation::name(self)))?;
        serde_json::to_value(result).to_encode_error(format!(
            "Result of {} is not serializable",
            Computation::name(self)
        ))
    }
}

fn with_computation(err: MapReduceError, name: &str) -> MapReduceError {
    match err {
        MapReduceError::Compute {
            code,
            message,
            computation: None,
            source,
        } => MapReduceError::Compute {
            code,
            message,
            computation: Some(name.to_string()),
            source,
        },
        other => other,
    }
}

/// Compute error for a record a computation cannot handle
pub fn unsupported_value(computation: &str, value: &Value) -> MapReduceError {
    MapReduceError::compute_with_code(
        ErrorCode::COMPUTE_GENERIC,
        format!("unsupported input value {}", value),
        Some(computation.to_string()),
    )
}
