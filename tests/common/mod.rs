//! Common test utilities and helpers
#![allow(dead_code)]

use brokermr::broker::{Broker, MemoryBroker};
use brokermr::computation::{Computation, DynComputation, Mapped, SumOfSquares, Values};
use brokermr::config::{CoordinatorConfig, WorkerConfig};
use brokermr::coordinator::Coordinator;
use brokermr::error::MapReduceResult;
use brokermr::source::{DataSource, Partition, Records};
use brokermr::worker::WorkerPool;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single test scenario
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(20);

pub fn memory_broker() -> Arc<MemoryBroker> {
    Arc::new(MemoryBroker::new())
}

pub fn coordinator(broker: &Arc<MemoryBroker>, workers: u32) -> Coordinator {
    coordinator_with(broker, CoordinatorConfig {
        workers,
        ..Default::default()
    })
}

pub fn coordinator_with(broker: &Arc<MemoryBroker>, config: CoordinatorConfig) -> Coordinator {
    let broker: Arc<dyn Broker> = broker.clone();
    Coordinator::new(broker, config)
}

/// Start `size` in-process workers of `computation` on `broker`
pub async fn start_pool(
    broker: &Arc<MemoryBroker>,
    computation: impl DynComputation + 'static,
    size: usize,
) -> WorkerPool {
    start_pool_with(broker, computation, size, WorkerConfig::default()).await
}

pub async fn start_pool_with(
    broker: &Arc<MemoryBroker>,
    computation: impl DynComputation + 'static,
    size: usize,
    config: WorkerConfig,
) -> WorkerPool {
    WorkerPool::start(Arc::new(computation), broker.clone(), config, size)
        .await
        .expect("worker pool starts")
}

/// Fail the test instead of hanging when a scenario stalls
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(SCENARIO_TIMEOUT, future)
        .await
        .expect("scenario finished in time")
}

/// Wait until `condition` holds, polling every few milliseconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within_timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Map and reduce `source` in-process, without a broker
pub fn run_directly<C: Computation>(computation: &C, source: &dyn DataSource) -> C::Output {
    let records = source.iterate(Partition::new(0, source.full_length()));
    let mapped = computation
        .map(records)
        .collect::<MapReduceResult<Vec<_>>>()
        .expect("map succeeds");
    computation
        .reduce(Box::new(mapped.into_iter()))
        .expect("reduce succeeds")
}

/// Sum of squares that counts how many records it mapped
pub struct CountingSquares {
    inner: SumOfSquares,
    pub mapped: Arc<AtomicUsize>,
}

impl CountingSquares {
    pub fn new() -> Self {
        Self {
            inner: SumOfSquares::new("counting_squares"),
            mapped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn shared(&self) -> Self {
        Self {
            inner: self.inner,
            mapped: Arc::clone(&self.mapped),
        }
    }

    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }
}

impl Computation for CountingSquares {
    type Output = i64;

    fn name(&self) -> &str {
        Computation::name(&self.inner)
    }

    fn map<'a>(&'a self, records: Records<'a>) -> Mapped<'a, i64> {
        let counter = Arc::clone(&self.mapped);
        let counted: Records<'a> = Box::new(records.inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        self.inner.map(counted)
    }

    fn reduce(&self, values: Values<'_, i64>) -> MapReduceResult<i64> {
        self.inner.reduce(values)
    }
}
