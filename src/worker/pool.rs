//! In-process worker pool
//!
//! Runs `size` workers of one computation as tokio tasks sharing a broker.
//! Each worker holds its own consumer, so the broker distributes requests
//! between them exactly as it would between separate processes.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Worker, WorkerStats};
use crate::broker::Broker;
use crate::computation::DynComputation;
use crate::config::WorkerConfig;
use crate::error::{MapReduceError, MapReduceResult};

pub struct WorkerPool {
    queue: String,
    handles: Vec<JoinHandle<MapReduceResult<WorkerStats>>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Declare the computation's queue and start `size` workers on it
    pub async fn start(
        computation: Arc<dyn DynComputation>,
        broker: Arc<dyn Broker>,
        config: WorkerConfig,
        size: usize,
    ) -> MapReduceResult<Self> {
        let queue = computation.routing_key();
        broker.declare_queue(&queue).await?;

        let (shutdown, _) = watch::channel(false);
        let handles = (0..size)
            .map(|i| {
                let worker = Worker::new(
                    Arc::clone(&computation),
                    Arc::clone(&broker),
                    config.clone(),
                )
                .with_id(format!("worker-{}", i));
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    worker
                        .listen_until(async move {
                            let _ = stop.wait_for(|stopped| *stopped).await;
                        })
                        .await
                })
            })
            .collect();

        info!(queue = %queue, size, "Worker pool started");
        Ok(Self {
            queue,
            handles,
            shutdown,
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop every worker after its current request and total their counters
    ///
    /// The first worker error, if any, is returned after all workers stopped.
    pub async fn shutdown(self) -> MapReduceResult<WorkerStats> {
        let _ = self.shutdown.send(true);

        let mut total = WorkerStats::default();
        let mut first_error = None;
        for joined in join_all(self.handles).await {
            let result = joined.map_err(|e| {
                MapReduceError::other("Worker task did not complete").with_source(e)
            });
            match result.and_then(|stats| stats) {
                Ok(stats) => total = total.merge(stats),
                Err(e) => {
                    warn!(queue = %self.queue, "Worker stopped with error: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(queue = %self.queue, replied = total.replied, "Worker pool stopped");
                Ok(total)
            }
        }
    }
}
