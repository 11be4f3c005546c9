//! Built-in computations

use serde_json::Value;

use super::{unsupported_value, Computation, Mapped, Values};
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};
use crate::source::{ArithmeticSpec, Records, SourceFactory, SourceSpec};

/// Sum of the squares of integer values
#[derive(Debug, Clone, Copy)]
pub struct SumOfSquares {
    name: &'static str,
}

impl SumOfSquares {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for SumOfSquares {
    fn default() -> Self {
        Self::new("sum_of_squares")
    }
}

impl Computation for SumOfSquares {
    type Output = i64;

    fn name(&self) -> &str {
        self.name
    }

    fn map<'a>(&'a self, records: Records<'a>) -> Mapped<'a, i64> {
        Box::new(records.map(move |record| {
            let n = record
                .value
                .as_i64()
                .ok_or_else(|| unsupported_value(self.name, &record.value))?;
            n.checked_mul(n).ok_or_else(|| overflow(self.name))
        }))
    }

    fn reduce(&self, mut values: Values<'_, i64>) -> MapReduceResult<i64> {
        values.try_fold(0i64, |acc, v| acc.checked_add(v).ok_or_else(|| overflow(self.name)))
    }
}

fn overflow(name: &str) -> MapReduceError {
    MapReduceError::compute_with_code(
        ErrorCode::COMPUTE_GENERIC,
        "integer overflow",
        Some(name.to_string()),
    )
}

/// Rectangle-rule integral of `exp(x)` over the sampled points
#[derive(Debug, Clone, Copy)]
pub struct IntegrateExp {
    pub dx: f64,
}

impl IntegrateExp {
    pub const NAME: &'static str = "integrate_exp";

    pub fn new(dx: f64) -> Self {
        Self { dx }
    }

    /// Factory sampling `[from, to)` every `dx`
    pub fn factory(&self, from: f64, to: f64) -> SourceFactory {
        let length = ((to - from) / self.dx).round().max(0.0) as u64;
        SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::floats(
            from, self.dx, length,
        )))
    }
}

impl Default for IntegrateExp {
    fn default() -> Self {
        Self::new(1e-5)
    }
}

impl Computation for IntegrateExp {
    type Output = f64;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn map<'a>(&'a self, records: Records<'a>) -> Mapped<'a, f64> {
        Box::new(records.map(move |record| match record.value {
            Value::Number(ref n) => n
                .as_f64()
                .map(|x| x.exp() * self.dx)
                .ok_or_else(|| unsupported_value(Self::NAME, &record.value)),
            ref other => Err(unsupported_value(Self::NAME, other)),
        }))
    }

    fn reduce(&self, values: Values<'_, f64>) -> MapReduceResult<f64> {
        Ok(values.sum())
    }
}
