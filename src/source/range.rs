//! Computed-range source: values of an arithmetic progression

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DataSource, Partition, Record, Records};
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};

/// `start + i * step` for `i` in `0..length`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Progression {
    Integer { start: i64, step: i64 },
    Float { start: f64, step: f64 },
}

/// Construction parameters for an [`ArithmeticSource`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticSpec {
    pub progression: Progression,
    pub length: u64,
}

impl ArithmeticSpec {
    /// Integers `0..length`
    pub fn integers(length: u64) -> Self {
        Self {
            progression: Progression::Integer { start: 0, step: 1 },
            length,
        }
    }

    /// Floats `start, start + step, ...` with `length` elements
    pub fn floats(start: f64, step: f64, length: u64) -> Self {
        Self {
            progression: Progression::Float { start, step },
            length,
        }
    }

    /// Reject progressions that produce non-finite values
    pub fn validate(&self) -> MapReduceResult<()> {
        if let Progression::Float { start, step } = self.progression {
            if !start.is_finite() || !step.is_finite() {
                return Err(MapReduceError::configuration_with_code(
                    ErrorCode::CONFIG_MALFORMED_SOURCE,
                    format!("float progression must be finite (start={}, step={})", start, step),
                ));
            }
            let last = start + step * self.length.saturating_sub(1) as f64;
            if !last.is_finite() {
                return Err(MapReduceError::configuration_with_code(
                    ErrorCode::CONFIG_MALFORMED_SOURCE,
                    "float progression overflows before its last element",
                ));
            }
        }
        Ok(())
    }
}

/// Source whose values are derived from their position
#[derive(Debug, Clone)]
pub struct ArithmeticSource {
    spec: ArithmeticSpec,
}

impl ArithmeticSource {
    pub fn new(spec: ArithmeticSpec) -> MapReduceResult<Self> {
        spec.validate()?;
        Ok(Self { spec })
    }

    fn value_at(&self, position: u64) -> Value {
        match self.spec.progression {
            Progression::Integer { start, step } => {
                let offset = (position as i64).saturating_mul(step);
                Value::from(start.saturating_add(offset))
            }
            Progression::Float { start, step } => Value::from(start + step * position as f64),
        }
    }
}

impl DataSource for ArithmeticSource {
    fn iterate(&self, partition: Partition) -> Records<'_> {
        let range = partition.clamp_to(self.spec.length);
        Box::new(
            (range.offset..range.end()).map(move |position| {
                Record::positional(position, self.value_at(position))
            }),
        )
    }

    fn full_length(&self) -> u64 {
        self.spec.length
    }
}
