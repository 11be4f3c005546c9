//! Worker: competing consumer executing partition requests
//!
//! A worker binds to the queue named for its computation with a prefetch of
//! one. For every request it rebuilds the data source, runs map and reduce on
//! a blocking task, publishes the partial result to the request's reply
//! address and only then acknowledges the request.
//!
//! A request that cannot be decoded or computed is left unacknowledged: the
//! worker releases its consumer and the broker redelivers. Once a delivery
//! count exceeds `max_deliveries` the request is moved to the quarantine queue.

pub mod poison;
pub mod pool;

pub use pool::WorkerPool;

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Consumer, Delivery, Envelope};
use crate::computation::{DynComputation, Registry};
use crate::config::WorkerConfig;
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};
use crate::protocol::{decode_request, encode_reply, PartitionReply};
use crate::source::SourceFactory;

/// Prefetch every worker consumes with
pub const WORKER_PREFETCH: usize = 1;

/// A computed reply and where it goes
#[derive(Debug, Clone)]
pub struct Reply {
    pub queue: String,
    pub envelope: Envelope,
}

/// What a worker did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Reply published, request acknowledged
    Replied,
    /// Request returned to the queue after a failure
    Released,
    /// Request moved to the quarantine queue and acknowledged
    Quarantined,
    /// The run's reply queue no longer exists; request acknowledged
    Orphaned,
}

/// Counters over a worker's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub replied: u64,
    pub released: u64,
    pub quarantined: u64,
    pub orphaned: u64,
}

impl WorkerStats {
    fn record(mut self, disposition: &Disposition) -> Self {
        match disposition {
            Disposition::Replied => self.replied += 1,
            Disposition::Released => self.released += 1,
            Disposition::Quarantined => self.quarantined += 1,
            Disposition::Orphaned => self.orphaned += 1,
        }
        self
    }

    pub fn merge(self, other: WorkerStats) -> Self {
        Self {
            replied: self.replied + other.replied,
            released: self.released + other.released,
            quarantined: self.quarantined + other.quarantined,
            orphaned: self.orphaned + other.orphaned,
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    id: String,
    computation: Arc<dyn DynComputation>,
    broker: Arc<dyn Broker>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        computation: Arc<dyn DynComputation>,
        broker: Arc<dyn Broker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: "worker-0".to_string(),
            computation,
            broker,
            config,
        }
    }

    /// Worker for a registered computation identity
    pub fn from_registry(
        name: &str,
        registry: &Registry,
        broker: Arc<dyn Broker>,
        config: WorkerConfig,
    ) -> MapReduceResult<Self> {
        let entry = registry.get(name)?;
        Ok(Self::new(Arc::clone(&entry.computation), broker, config))
    }

    /// Name used in logs
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn queue(&self) -> String {
        self.computation.routing_key()
    }

    pub fn quarantine_queue(&self) -> String {
        poison::quarantine_queue(&self.queue(), &self.config.quarantine_suffix)
    }

    /// Consume until the broker closes the stream
    pub async fn listen(&self) -> MapReduceResult<WorkerStats> {
        self.listen_until(std::future::pending()).await
    }

    /// Consume until `shutdown` resolves or the broker closes the stream
    ///
    /// Broker failures propagate; request failures do not.
    pub async fn listen_until<F>(&self, shutdown: F) -> MapReduceResult<WorkerStats>
    where
        F: Future<Output = ()> + Send,
    {
        let queue = self.queue();
        self.broker.declare_queue(&queue).await?;
        let mut consumer = self.broker.consume(&queue, WORKER_PREFETCH).await?;
        info!(worker = %self.id, queue = %queue, "Worker listening");

        tokio::pin!(shutdown);
        let mut stats = WorkerStats::default();
        loop {
            let delivery = tokio::select! {
                _ = &mut shutdown => {
                    info!(worker = %self.id, "Worker shutting down");
                    break;
                }
                next = consumer.next() => match next? {
                    Some(delivery) => delivery,
                    None => {
                        info!(worker = %self.id, "Broker closed the consumer");
                        break;
                    }
                },
            };

            let disposition = self.handle(consumer.as_mut(), delivery).await?;
            stats = stats.record(&disposition);
        }
        Ok(stats)
    }

    /// Process one delivery and settle it with the broker
    pub async fn handle(
        &self,
        consumer: &mut dyn Consumer,
        delivery: Delivery,
    ) -> MapReduceResult<Disposition> {
        if poison::exceeds_max_deliveries(delivery.delivery_count, self.config.max_deliveries) {
            return self.quarantine(consumer, delivery).await;
        }
        if delivery.redelivered() {
            debug!(
                worker = %self.id,
                deliveries = delivery.delivery_count,
                "Processing redelivered request"
            );
        }

        let reply = match self.execute(&delivery.envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                let correlation = delivery
                    .envelope
                    .correlation
                    .map(|c| c.token())
                    .unwrap_or_default();
                if matches!(e, MapReduceError::Decode { .. }) {
                    warn!(
                        worker = %self.id,
                        correlation = %correlation,
                        "Rejecting request: {}",
                        e
                    );
                } else {
                    error!(worker = %self.id, correlation = %correlation, "Request failed: {}", e);
                }
                consumer.release().await?;
                return Ok(Disposition::Released);
            }
        };

        match self.broker.publish(&reply.queue, reply.envelope).await {
            Ok(()) => {
                consumer.ack(delivery.tag).await?;
                Ok(Disposition::Replied)
            }
            Err(e) if e.is_queue_not_found() => {
                warn!(
                    worker = %self.id,
                    queue = %reply.queue,
                    "Reply queue is gone, dropping result of a finished run"
                );
                consumer.ack(delivery.tag).await?;
                Ok(Disposition::Orphaned)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decode a request, compute its partial result and build the reply
    pub async fn execute(&self, envelope: &Envelope) -> MapReduceResult<Reply> {
        let request = decode_request(&envelope.payload)?;
        if request.computation != self.computation.name() {
            return Err(MapReduceError::decode_with_code(
                ErrorCode::DECODE_MISROUTED,
                format!(
                    "Request for '{}' reached the '{}' queue",
                    request.computation,
                    self.computation.name()
                ),
            ));
        }
        let queue = envelope.reply_to.clone().ok_or_else(|| {
            MapReduceError::decode_with_code(
                ErrorCode::DECODE_MALFORMED,
                "Request carries no reply address",
            )
        })?;
        let correlation = envelope.correlation.unwrap_or_else(|| request.correlation());

        let partial = self.compute(&request.factory).await?;
        let payload = encode_reply(&PartitionReply { partial })?;

        debug!(worker = %self.id, correlation = %correlation, "Computed partition");
        Ok(Reply {
            queue,
            envelope: Envelope::new(payload).with_correlation(correlation),
        })
    }

    async fn compute(&self, factory: &SourceFactory) -> MapReduceResult<Value> {
        let partition = factory.partition()?;
        let source = factory.build().await?;
        let computation = Arc::clone(&self.computation);

        tokio::task::spawn_blocking(move || computation.run_partition(source.as_ref(), partition))
            .await
            .map_err(|e| {
                let code = if e.is_panic() {
                    ErrorCode::COMPUTE_PANICKED
                } else {
                    ErrorCode::COMPUTE_GENERIC
                };
                MapReduceError::compute_with_code(
                    code,
                    "map/reduce task did not complete",
                    Some(self.computation.name().to_string()),
                )
                .with_source(e)
            })?
    }

    async fn quarantine(
        &self,
        consumer: &mut dyn Consumer,
        delivery: Delivery,
    ) -> MapReduceResult<Disposition> {
        let queue = self.quarantine_queue();
        warn!(
            worker = %self.id,
            queue = %queue,
            deliveries = delivery.delivery_count,
            "Quarantining poison request"
        );
        self.broker.declare_queue(&queue).await?;
        self.broker.publish(&queue, delivery.envelope).await?;
        consumer.ack(delivery.tag).await?;
        Ok(Disposition::Quarantined)
    }
}
