//! Broker factory for creating broker instances

use std::sync::Arc;

use super::error::BrokerResult;
use super::{Broker, MemoryBroker};
use crate::config::{BrokerBackend, BrokerConfig};

/// Factory for creating broker instances
pub struct BrokerFactory;

impl BrokerFactory {
    /// Create a broker from explicit configuration
    pub async fn from_config(config: &BrokerConfig) -> BrokerResult<Arc<dyn Broker>> {
        match config.backend {
            BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
            #[cfg(feature = "redis")]
            BrokerBackend::Redis => {
                let broker = super::RedisBroker::connect(config).await?;
                Ok(Arc::new(broker))
            }
            #[cfg(not(feature = "redis"))]
            BrokerBackend::Redis => Err(super::BrokerError::configuration(
                "Redis broker not enabled. Enable with --features redis",
            )),
        }
    }
}
