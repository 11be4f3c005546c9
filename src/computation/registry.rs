//! Static registry of computations
//!
//! Workers and the CLI resolve computation identities here; nothing is loaded
//! at runtime.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::builtin::{IntegrateExp, SumOfSquares};
use super::{Computation, DynComputation};
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};
use crate::source::{ArithmeticSpec, SourceFactory, SourceSpec};

/// Computations shipped with the crate
pub static BUILTIN: Lazy<Registry> = Lazy::new(Registry::builtin);

/// A computation together with the dataset it runs on by default
#[derive(Clone)]
pub struct RegisteredComputation {
    pub computation: Arc<dyn DynComputation>,
    pub description: &'static str,
    default_factory: fn() -> SourceFactory,
}

impl RegisteredComputation {
    pub fn name(&self) -> &str {
        self.computation.name()
    }

    pub fn default_factory(&self) -> SourceFactory {
        (self.default_factory)()
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegisteredComputation>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in computations
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SumOfSquares::new("sum_of_squares"),
            "Sum of squares of the integers 0..1_000_000",
            || {
                SourceFactory::derived(SourceSpec::Arithmetic(ArithmeticSpec::integers(
                    1_000_000,
                )))
            },
        );
        registry.register(
            SumOfSquares::new("sum_of_squares_inline"),
            "Sum of squares of an inline list of the integers 0..100_000",
            || SourceFactory::inline((0..100_000i64).map(Value::from)),
        );
        registry.register(
            IntegrateExp::default(),
            "Integral of exp(x) over [1, 10] by the rectangle rule, dx = 1e-5",
            || IntegrateExp::default().factory(1.0, 10.0),
        );
        registry
    }

    /// Add a computation; a later registration replaces an earlier one of the same name
    pub fn register<C: Computation>(
        &mut self,
        computation: C,
        description: &'static str,
        default_factory: fn() -> SourceFactory,
    ) {
        let name = Computation::name(&computation).to_string();
        self.entries.insert(
            name,
            RegisteredComputation {
                computation: Arc::new(computation),
                description,
                default_factory,
            },
        );
    }

    pub fn get(&self, name: &str) -> MapReduceResult<&RegisteredComputation> {
        self.entries.get(name).ok_or_else(|| {
            MapReduceError::configuration_with_code(
                ErrorCode::CONFIG_UNKNOWN_COMPUTATION,
                format!(
                    "Unknown computation '{}'. Registered: {}",
                    name,
                    self.names().join(", ")
                ),
            )
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredComputation> {
        self.entries.values()
    }
}
