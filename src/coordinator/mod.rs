//! Coordinator: partitions a dataset, dispatches one request per partition and
//! reduces the correlated partial results
//!
//! A run proceeds in four steps:
//! 1. plan partitions from the factory's length and the configured worker count
//! 2. encode every request up front; any failure aborts before the first publish
//! 3. publish the requests with a reply address unique to the run
//! 4. collect replies into slots until none is outstanding, then apply the
//!    final reduce in emission order
//!
//! Without `partition_timeout` the coordinator never republishes and relies on
//! the broker redelivering work whose consumer failed.

pub mod partition;
pub mod run;

pub use partition::{partition_length, plan_partitions, PartitionStrategy};
pub use run::{ReplyOutcome, RunContext};

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Correlation, Envelope};
use crate::computation::{Computation, DynComputation};
use crate::config::CoordinatorConfig;
use crate::error::{ErrorCode, ErrorExt, MapReduceError, MapReduceResult};
use crate::protocol::{encode_request, PartitionRequest};
use crate::source::SourceFactory;

/// Runs map/reduce computations over a broker
///
/// Holds no per-run state; concurrent calls on one coordinator are independent.
pub struct Coordinator {
    broker: Arc<dyn Broker>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(broker: Arc<dyn Broker>, config: CoordinatorConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run a typed computation and decode its final result
    pub async fn run<C: Computation>(
        &self,
        computation: &C,
        factory: &SourceFactory,
    ) -> MapReduceResult<C::Output> {
        let value = self.run_dyn(computation, factory).await?;
        serde_json::from_value(value).to_decode_error(format!(
            "Final result of {} has an unexpected shape",
            Computation::name(computation)
        ))
    }

    /// Run a computation and return its final result as JSON
    pub async fn run_dyn(
        &self,
        computation: &dyn DynComputation,
        factory: &SourceFactory,
    ) -> MapReduceResult<Value> {
        let started = StdInstant::now();
        let length = factory.length()?;
        let partitions = plan_partitions(length, self.config.workers, self.config.strategy)?;
        let run_id = Uuid::new_v4();

        let requests = partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| -> MapReduceResult<(Correlation, Vec<u8>)> {
                let request = PartitionRequest {
                    run_id,
                    sequence_index: index as u32,
                    computation: computation.name().to_string(),
                    factory: factory.slice(partition.offset, partition.limit)?,
                };
                Ok((request.correlation(), encode_request(&request)?))
            })
            .collect::<MapReduceResult<Vec<_>>>()?;

        let routing_key = computation.routing_key();
        self.broker.declare_queue(&routing_key).await?;
        let reply_queue = self.broker.declare_reply_queue().await?;

        info!(
            run_id = %run_id,
            computation = computation.name(),
            length,
            partitions = partitions.len(),
            "Starting run"
        );

        let envelopes: Vec<Envelope> = requests
            .into_iter()
            .map(|(correlation, payload)| {
                Envelope::new(payload)
                    .with_correlation(correlation)
                    .with_reply_to(reply_queue.clone())
            })
            .collect();
        let context = RunContext::new(run_id, reply_queue.clone(), envelopes.len());

        let collected = self.dispatch_and_collect(context, &routing_key, &envelopes).await;
        if let Err(e) = self.broker.delete_queue(&reply_queue).await {
            warn!(run_id = %run_id, "Failed to delete reply queue {}: {}", reply_queue, e);
        }

        let partials = collected
            .map_err(|e| tag_run(e, run_id))?
            .into_partials()?;
        let result = computation.reduce_partials(partials)?;

        info!(
            run_id = %run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run complete"
        );
        Ok(result)
    }

    async fn dispatch_and_collect(
        &self,
        mut context: RunContext,
        routing_key: &str,
        envelopes: &[Envelope],
    ) -> MapReduceResult<RunContext> {
        let mut consumer = self
            .broker
            .consume(context.reply_queue(), self.config.reply_prefetch)
            .await?;

        for (index, envelope) in envelopes.iter().enumerate() {
            self.broker.publish(routing_key, envelope.clone()).await?;
            context = context.record_dispatch(index, Instant::now(), self.config.partition_timeout);
        }
        debug!(run_id = %context.run_id(), count = envelopes.len(), "Dispatched partitions");

        while !context.is_complete() {
            let next = match context.next_deadline() {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, consumer.next()).await {
                        Ok(next) => next?,
                        Err(_) => {
                            context = self
                                .redispatch_expired(context, routing_key, envelopes)
                                .await?;
                            continue;
                        }
                    }
                }
                None => consumer.next().await?,
            };

            let Some(delivery) = next else {
                return Err(MapReduceError::broker_with_code(
                    ErrorCode::BROKER_DISCONNECTED,
                    format!(
                        "Reply stream closed with {} partitions outstanding",
                        context.outstanding()
                    ),
                ));
            };

            let (updated, outcome) =
                context.apply_reply(delivery.envelope.correlation, &delivery.envelope.payload);
            context = updated;
            log_outcome(&context, &outcome);
            consumer.ack(delivery.tag).await?;
        }

        Ok(context)
    }

    /// Republish every expired partition, failing once one has used its attempts
    async fn redispatch_expired(
        &self,
        mut context: RunContext,
        routing_key: &str,
        envelopes: &[Envelope],
    ) -> MapReduceResult<RunContext> {
        let now = Instant::now();
        for index in context.expired(now) {
            let attempts = context.attempts(index);
            if attempts >= self.config.max_attempts {
                return Err(MapReduceError::coordination_with_code(
                    ErrorCode::COORD_PARTITION_EXHAUSTED,
                    format!(
                        "Partition {} got no reply after {} dispatches",
                        index, attempts
                    ),
                    Some(context.run_id().to_string()),
                ));
            }

            warn!(
                run_id = %context.run_id(),
                partition = index,
                attempt = attempts + 1,
                "Partition deadline expired, republishing"
            );
            self.broker.publish(routing_key, envelopes[index].clone()).await?;
            context = context.record_dispatch(index, now, self.config.partition_timeout);
        }
        Ok(context)
    }
}

fn log_outcome(context: &RunContext, outcome: &ReplyOutcome) {
    let run_id = context.run_id();
    match outcome {
        ReplyOutcome::Accepted { index } => debug!(
            run_id = %run_id,
            partition = index,
            outstanding = context.outstanding(),
            "Accepted reply"
        ),
        ReplyOutcome::Foreign { run_id: other } => {
            debug!(run_id = %run_id, foreign = %other, "Ignoring reply for another run")
        }
        ReplyOutcome::Duplicate { index } => {
            debug!(run_id = %run_id, partition = index, "Ignoring duplicate reply")
        }
        ReplyOutcome::OutOfRange { index } => {
            warn!(run_id = %run_id, partition = index, "Ignoring reply with out-of-range index")
        }
        ReplyOutcome::Uncorrelated => {
            warn!(run_id = %run_id, "Ignoring reply without correlation")
        }
        ReplyOutcome::Corrupt { index, reason } => warn!(
            run_id = %run_id,
            partition = index,
            "Ignoring undecodable reply: {}",
            reason
        ),
    }
}

fn tag_run(err: MapReduceError, run_id: Uuid) -> MapReduceError {
    match err {
        MapReduceError::Coordination { .. } => err,
        other => other.with_context(format!("run {}", run_id)),
    }
}
