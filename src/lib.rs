//! # brokermr
//!
//! Single-stage map/reduce coordinated over a message broker.
//!
//! A coordinator cuts a dataset into contiguous partitions, publishes one
//! request per partition to the queue named for the computation, and reduces
//! the correlated partial results in emission order. Workers compete for
//! requests on that queue, rebuild the data source from the request's factory
//! and reply with the partition's reduced value.
//!
//! ## Usage
//!
//! ```bash
//! brokermr run --computation sum_of_squares --workers 8
//! brokermr worker --computation sum_of_squares -w 4
//! ```
//!
//! ## Modules
//!
//! - `broker` - Broker and consumer traits with in-memory and Redis adapters
//! - `computation` - Map/reduce contract and the static registry of computations
//! - `config` - TOML configuration with environment overrides
//! - `coordinator` - Partition planning, dispatch and result collection
//! - `error` - Crate-wide error type with numeric error codes
//! - `protocol` - Versioned wire format of requests and replies
//! - `source` - Data sources and the serializable factories that rebuild them
//! - `worker` - Competing-consumer workers and the in-process worker pool
pub mod broker;
pub mod computation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod source;
pub mod worker;

pub use broker::{Broker, BrokerFactory, Consumer, Correlation, Envelope, MemoryBroker};
pub use computation::{Computation, DynComputation, Registry};
pub use config::BrokerMrConfig;
pub use coordinator::Coordinator;
pub use error::{MapReduceError, MapReduceResult};
pub use source::{DataSource, SourceFactory};
pub use worker::{Worker, WorkerPool};
