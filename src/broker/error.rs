//! Error types for the broker adapters

use crate::error::{ErrorCode, MapReduceError};
use std::fmt;
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker error types
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not reach the broker
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker closed the connection or the consumer stream
    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    /// Queue was never declared or has been deleted
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Ack for a tag this consumer does not hold
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    /// The broker returned data the adapter cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Adapter configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic error wrapper
    #[error("Broker error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// Create a connection error
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        Self::Connection(err.to_string())
    }

    /// Create a disconnected error
    pub fn disconnected<E: fmt::Display>(msg: E) -> Self {
        Self::Disconnected(msg.to_string())
    }

    /// Create a queue not found error
    pub fn queue_not_found<E: fmt::Display>(queue: E) -> Self {
        Self::QueueNotFound(queue.to_string())
    }

    /// Create a protocol error
    pub fn protocol<E: fmt::Display>(msg: E) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a configuration error
    pub fn configuration<E: fmt::Display>(msg: E) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Disconnected(_))
    }

    /// Check if this is a queue not found error
    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::connection(err)
        } else if err.is_timeout() {
            Self::disconnected(err)
        } else {
            Self::protocol(err)
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::connection(format!("Failed to get Redis connection: {}", err))
    }
}

/// Convert BrokerError to MapReduceError
impl From<BrokerError> for MapReduceError {
    fn from(err: BrokerError) -> Self {
        let code = match &err {
            BrokerError::Connection(_) => ErrorCode::BROKER_CONNECTION,
            BrokerError::Disconnected(_) => ErrorCode::BROKER_DISCONNECTED,
            BrokerError::QueueNotFound(_) => ErrorCode::BROKER_QUEUE_NOT_FOUND,
            BrokerError::UnknownDelivery(_) => ErrorCode::BROKER_UNKNOWN_DELIVERY,
            BrokerError::Configuration(_) => {
                return MapReduceError::configuration(err.to_string()).with_source(err)
            }
            BrokerError::Protocol(_) | BrokerError::Other(_) => ErrorCode::BROKER_GENERIC,
        };

        MapReduceError::broker_with_code(code, err.to_string()).with_source(err)
    }
}
