//! Message broker abstraction
//!
//! The coordinator and the workers only talk to the broker through the
//! [`Broker`] and [`Consumer`] traits. Two adapters are provided: an
//! in-process [`MemoryBroker`] and, behind the `redis` feature, a
//! `RedisBroker` implementing the reliable-queue pattern.
//!
//! Delivery semantics expected from every adapter:
//! - at-least-once delivery with manual acknowledgment
//! - competing consumers on a named queue
//! - unacknowledged deliveries return to their queue when the consumer
//!   releases them, is dropped, or dies

pub mod error;
pub mod factory;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use error::{BrokerError, BrokerResult};
pub use factory::BrokerFactory;
pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

use crate::error::{ErrorCode, MapReduceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies the partition a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    pub run_id: Uuid,
    pub sequence_index: u32,
}

impl Correlation {
    pub fn new(run_id: Uuid, sequence_index: u32) -> Self {
        Self {
            run_id,
            sequence_index,
        }
    }

    /// Legacy single-string form, `{run_id}_{sequence_index}`
    pub fn token(&self) -> String {
        format!("{}_{}", self.run_id, self.sequence_index)
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

impl FromStr for Correlation {
    type Err = MapReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (run_id, index) = s.rsplit_once('_').ok_or_else(|| {
            MapReduceError::decode(format!("Correlation token '{}' has no separator", s))
        })?;

        let run_id = Uuid::parse_str(run_id).map_err(|e| {
            MapReduceError::decode(format!("Invalid run id in correlation token '{}'", s))
                .with_source(e)
        })?;
        let sequence_index = index.parse::<u32>().map_err(|e| {
            MapReduceError::decode_with_code(
                ErrorCode::DECODE_MALFORMED,
                format!("Invalid sequence index in correlation token '{}'", s),
            )
            .with_source(e)
        })?;

        Ok(Self::new(run_id, sequence_index))
    }
}

/// A message as published to a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub correlation: Option<Correlation>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            correlation: None,
            reply_to: None,
        }
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Consumer-scoped handle used to acknowledge a delivery
pub type DeliveryTag = u64;

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub envelope: Envelope,
    /// How many times this message has been handed out, this delivery included
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Broker operations shared by coordinator and workers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short adapter name used in logs
    fn name(&self) -> &'static str;

    /// Declare a durable work queue; idempotent
    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    /// Declare a fresh exclusive reply queue and return its name
    async fn declare_reply_queue(&self) -> BrokerResult<String>;

    /// Delete a queue and every message still in it
    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    /// Publish a message to a declared queue
    async fn publish(&self, queue: &str, envelope: Envelope) -> BrokerResult<()>;

    /// Attach a consumer holding at most `prefetch` unacknowledged deliveries
    async fn consume(&self, queue: &str, prefetch: usize) -> BrokerResult<Box<dyn Consumer>>;
}

/// A competing consumer bound to one queue
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery; `None` once the broker closed the stream
    async fn next(&mut self) -> BrokerResult<Option<Delivery>>;

    /// Acknowledge a delivery, removing it from the broker
    async fn ack(&mut self, tag: DeliveryTag) -> BrokerResult<()>;

    /// Return every unacknowledged delivery to the queue
    async fn release(&mut self) -> BrokerResult<()>;
}
