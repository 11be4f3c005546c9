//! Redis broker adapter
//!
//! Implements the reliable-queue pattern on plain Redis data structures:
//!
//! - `queue:<name>` list of ready message ids
//! - `msg:<id>` hash holding payload, correlation, reply address and delivery count
//! - `inflight:<queue>:<consumer>` list of ids taken but not yet acknowledged
//! - `alive:<consumer>` heartbeat key with a TTL
//! - `consumers:<queue>` set of consumers that ever attached to the queue
//! - `queues` set of declared queue names
//!
//! Taking a message moves its id atomically from the queue to the consumer's
//! inflight list. Every consumer runs a background ticker that refreshes its
//! heartbeat and consumer-set membership, so a long computation between
//! `next()` calls does not look like a crash. A consumer whose heartbeat
//! expired is presumed dead, and the next consumer polling the same queue
//! moves its inflight ids back to the head of the queue.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{BrokerError, BrokerResult};
use super::{Broker, Consumer, Correlation, Delivery, DeliveryTag, Envelope};
use crate::config::BrokerConfig;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_RUN_ID: &str = "run_id";
const FIELD_SEQUENCE_INDEX: &str = "sequence_index";
const FIELD_REPLY_TO: &str = "reply_to";
const FIELD_DELIVERIES: &str = "deliveries";

/// Key layout under a configurable prefix
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn queues(&self) -> String {
        format!("{}queues", self.prefix)
    }

    fn queue(&self, name: &str) -> String {
        format!("{}queue:{}", self.prefix, name)
    }

    fn message(&self, id: &str) -> String {
        format!("{}msg:{}", self.prefix, id)
    }

    fn inflight(&self, queue: &str, consumer: &str) -> String {
        format!("{}inflight:{}:{}", self.prefix, queue, consumer)
    }

    fn alive(&self, consumer: &str) -> String {
        format!("{}alive:{}", self.prefix, consumer)
    }

    fn consumers(&self, queue: &str) -> String {
        format!("{}consumers:{}", self.prefix, queue)
    }
}

/// Redis-backed broker
pub struct RedisBroker {
    pool: Arc<Pool>,
    keys: Keys,
    heartbeat_ttl: Duration,
    poll_interval: Duration,
}

impl RedisBroker {
    /// Connect to Redis and verify the connection
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| BrokerError::configuration("Redis broker requires broker.url"))?;
        info!("Initializing Redis broker");

        let mut pool_config = Config::from_url(url);
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::connection(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            pool: Arc::new(pool),
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            heartbeat_ttl: config.heartbeat_ttl,
            poll_interval: config.poll_interval,
        })
    }

    async fn ensure_declared(&self, queue: &str) -> BrokerResult<()> {
        let mut conn = self.pool.get().await?;
        let declared: bool = redis::cmd("SISMEMBER")
            .arg(self.keys.queues())
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        if declared {
            Ok(())
        } else {
            Err(BrokerError::queue_not_found(queue))
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("SADD")
            .arg(self.keys.queues())
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        let name = format!("reply.{}", Uuid::new_v4());
        self.declare_queue(&name).await?;
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.queue(name))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.cmd("DEL").arg(self.keys.message(id)).ignore();
        }
        pipe.cmd("DEL").arg(self.keys.queue(name)).ignore();
        pipe.cmd("SREM").arg(self.keys.queues()).arg(name).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(queue = name, dropped = ids.len(), "Deleted queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> BrokerResult<()> {
        self.ensure_declared(queue).await?;

        let id = Uuid::new_v4().to_string();
        let message_key = self.keys.message(&id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(&message_key)
            .arg(FIELD_PAYLOAD)
            .arg(envelope.payload.as_slice())
            .arg(FIELD_DELIVERIES)
            .arg(0)
            .ignore();
        if let Some(correlation) = envelope.correlation {
            pipe.cmd("HSET")
                .arg(&message_key)
                .arg(FIELD_RUN_ID)
                .arg(correlation.run_id.to_string())
                .arg(FIELD_SEQUENCE_INDEX)
                .arg(correlation.sequence_index)
                .ignore();
        }
        if let Some(reply_to) = &envelope.reply_to {
            pipe.cmd("HSET")
                .arg(&message_key)
                .arg(FIELD_REPLY_TO)
                .arg(reply_to)
                .ignore();
        }
        pipe.cmd("RPUSH").arg(self.keys.queue(queue)).arg(&id).ignore();

        let mut conn = self.pool.get().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> BrokerResult<Box<dyn Consumer>> {
        if prefetch == 0 {
            return Err(BrokerError::configuration("prefetch must be at least 1"));
        }
        self.ensure_declared(queue).await?;

        let consumer_id = Uuid::new_v4().to_string();
        let heartbeat = heartbeat_pipeline(&self.keys, queue, &consumer_id, self.heartbeat_ttl);
        let mut conn = self.pool.get().await?;
        let _: () = heartbeat.query_async(&mut conn).await?;
        drop(conn);

        let ticker = spawn_heartbeat(
            Arc::clone(&self.pool),
            heartbeat,
            self.heartbeat_ttl / 3,
            consumer_id.clone(),
        );
        debug!(queue, consumer = %consumer_id, "Attached Redis consumer");
        Ok(Box::new(RedisConsumer {
            pool: Arc::clone(&self.pool),
            keys: self.keys.clone(),
            queue: queue.to_string(),
            consumer_id,
            prefetch,
            poll_interval: self.poll_interval,
            ticker,
            next_tag: 0,
            unacked: HashMap::new(),
        }))
    }
}

/// Consumer over a Redis queue
pub struct RedisConsumer {
    pool: Arc<Pool>,
    keys: Keys,
    queue: String,
    consumer_id: String,
    prefetch: usize,
    poll_interval: Duration,
    /// Keeps `alive:<consumer>` and the consumer-set entry fresh until drop
    ticker: JoinHandle<()>,
    next_tag: DeliveryTag,
    unacked: HashMap<DeliveryTag, String>,
}

/// Refresh the heartbeat key and re-register in the queue's consumer set
///
/// Re-registering matters after a peer wrongly presumed this consumer dead
/// and removed it from the set.
fn heartbeat_pipeline(
    keys: &Keys,
    queue: &str,
    consumer_id: &str,
    ttl: Duration,
) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(keys.alive(consumer_id))
        .arg(1)
        .arg("PX")
        .arg(ttl.as_millis() as u64)
        .ignore()
        .cmd("SADD")
        .arg(keys.consumers(queue))
        .arg(consumer_id)
        .ignore();
    pipe
}

fn spawn_heartbeat(
    pool: Arc<Pool>,
    heartbeat: redis::Pipeline,
    period: Duration,
    consumer_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the caller already sent one
        interval.tick().await;
        loop {
            interval.tick().await;
            let result: BrokerResult<()> = async {
                let mut conn = pool.get().await?;
                let _: () = heartbeat.query_async(&mut conn).await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                warn!(consumer = %consumer_id, "Failed to refresh heartbeat: {}", e);
            }
        }
    })
}

impl RedisConsumer {
    fn inflight_key(&self) -> String {
        self.keys.inflight(&self.queue, &self.consumer_id)
    }

    /// Return the inflight ids of consumers whose heartbeat expired
    async fn recover_dead_consumers(&self) -> BrokerResult<()> {
        let mut conn = self.pool.get().await?;
        let consumers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.consumers(&self.queue))
            .query_async(&mut conn)
            .await?;

        for other in consumers.iter().filter(|c| **c != self.consumer_id) {
            let alive: bool = redis::cmd("EXISTS")
                .arg(self.keys.alive(other))
                .query_async(&mut conn)
                .await?;
            if alive {
                continue;
            }

            let inflight = self.keys.inflight(&self.queue, other);
            let mut recovered = 0usize;
            loop {
                let moved: Option<String> = redis::cmd("LMOVE")
                    .arg(&inflight)
                    .arg(self.keys.queue(&self.queue))
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query_async(&mut conn)
                    .await?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
            let _: i64 = redis::cmd("SREM")
                .arg(self.keys.consumers(&self.queue))
                .arg(other)
                .query_async(&mut conn)
                .await?;

            if recovered > 0 {
                warn!(
                    queue = %self.queue,
                    consumer = %other,
                    recovered,
                    "Requeued deliveries of expired consumer"
                );
            }
        }
        Ok(())
    }

    async fn take(&mut self) -> BrokerResult<Option<Delivery>> {
        let mut conn = self.pool.get().await?;
        let taken: Option<String> = redis::cmd("BLMOVE")
            .arg(self.keys.queue(&self.queue))
            .arg(self.inflight_key())
            .arg("LEFT")
            .arg("RIGHT")
            .arg(self.poll_interval.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        let Some(id) = taken else {
            return Ok(None);
        };

        let message_key = self.keys.message(&id);
        let deliveries: u32 = redis::cmd("HINCRBY")
            .arg(&message_key)
            .arg(FIELD_DELIVERIES)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(&message_key)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = fields.get(FIELD_PAYLOAD).cloned() else {
            warn!(queue = %self.queue, id = %id, "Dropping id without message body");
            let _: i64 = redis::cmd("LREM")
                .arg(self.inflight_key())
                .arg(1)
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            let _: i64 = redis::cmd("DEL").arg(&message_key).query_async(&mut conn).await?;
            return Ok(None);
        };

        let envelope = Envelope {
            payload,
            correlation: parse_correlation(&fields)?,
            reply_to: text_field(&fields, FIELD_REPLY_TO)?,
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(tag, id);
        Ok(Some(Delivery {
            tag,
            envelope,
            delivery_count: deliveries,
        }))
    }
}

fn text_field(fields: &HashMap<String, Vec<u8>>, name: &str) -> BrokerResult<Option<String>> {
    fields
        .get(name)
        .map(|raw| {
            String::from_utf8(raw.clone())
                .map_err(|e| BrokerError::protocol(format!("field {} is not UTF-8: {}", name, e)))
        })
        .transpose()
}

fn parse_correlation(fields: &HashMap<String, Vec<u8>>) -> BrokerResult<Option<Correlation>> {
    let run_id = text_field(fields, FIELD_RUN_ID)?;
    let index = text_field(fields, FIELD_SEQUENCE_INDEX)?;
    match (run_id, index) {
        (Some(run_id), Some(index)) => {
            let run_id = Uuid::parse_str(&run_id)
                .map_err(|e| BrokerError::protocol(format!("invalid run id: {}", e)))?;
            let sequence_index = index
                .parse::<u32>()
                .map_err(|e| BrokerError::protocol(format!("invalid sequence index: {}", e)))?;
            Ok(Some(Correlation::new(run_id, sequence_index)))
        }
        _ => Ok(None),
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn next(&mut self) -> BrokerResult<Option<Delivery>> {
        loop {
            let declared: bool = {
                let mut conn = self.pool.get().await?;
                redis::cmd("SISMEMBER")
                    .arg(self.keys.queues())
                    .arg(&self.queue)
                    .query_async(&mut conn)
                    .await?
            };
            if !declared {
                return Ok(None);
            }

            if self.unacked.len() >= self.prefetch {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            self.recover_dead_consumers().await?;
            if let Some(delivery) = self.take().await? {
                return Ok(Some(delivery));
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> BrokerResult<()> {
        let id = self
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.inflight_key())
            .arg(1)
            .arg(&id)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.message(&id))
            .ignore();
        let mut conn = self.pool.get().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn release(&mut self) -> BrokerResult<()> {
        if self.unacked.is_empty() {
            return Ok(());
        }
        let mut pending: Vec<(DeliveryTag, String)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (_, id) in pending.iter().rev() {
            pipe.cmd("LREM").arg(self.inflight_key()).arg(1).arg(id).ignore();
            pipe.cmd("LPUSH").arg(self.keys.queue(&self.queue)).arg(id).ignore();
        }
        let mut conn = self.pool.get().await?;
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(queue = %self.queue, count = pending.len(), "Released unacknowledged deliveries");
        Ok(())
    }
}

impl Drop for RedisConsumer {
    fn drop(&mut self) {
        self.ticker.abort();
        // Without a runtime the heartbeat expiry path recovers the deliveries.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let keys = self.keys.clone();
        let queue = self.queue.clone();
        let consumer_id = self.consumer_id.clone();
        let mut pending: Vec<(DeliveryTag, String)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        handle.spawn(async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            let inflight = keys.inflight(&queue, &consumer_id);
            for (_, id) in pending.iter().rev() {
                pipe.cmd("LREM").arg(&inflight).arg(1).arg(id).ignore();
                pipe.cmd("LPUSH").arg(keys.queue(&queue)).arg(id).ignore();
            }
            pipe.cmd("DEL").arg(keys.alive(&consumer_id)).ignore();
            pipe.cmd("SREM")
                .arg(keys.consumers(&queue))
                .arg(&consumer_id)
                .ignore();

            let result: Result<(), BrokerError> = async {
                let mut conn = pool.get().await?;
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                warn!(queue = %queue, "Failed to return deliveries of dropped consumer: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys {
            prefix: "brokermr:".to_string(),
        };
        assert_eq!(keys.queue("brokermr.sum"), "brokermr:queue:brokermr.sum");
        assert_eq!(keys.message("abc"), "brokermr:msg:abc");
        assert_eq!(
            keys.inflight("brokermr.sum", "c1"),
            "brokermr:inflight:brokermr.sum:c1"
        );
        assert_eq!(keys.alive("c1"), "brokermr:alive:c1");
        assert_eq!(keys.consumers("q"), "brokermr:consumers:q");
    }

    #[test]
    fn test_heartbeat_reregisters_consumer() {
        let keys = Keys {
            prefix: "brokermr:".to_string(),
        };
        let pipe = heartbeat_pipeline(&keys, "brokermr.sum", "c1", Duration::from_secs(30));
        let packed = String::from_utf8(pipe.get_packed_pipeline()).unwrap();

        assert!(packed.contains("MULTI"));
        assert!(packed.contains("brokermr:alive:c1"));
        assert!(packed.contains("30000"));
        assert!(packed.contains("SADD"));
        assert!(packed.contains("brokermr:consumers:brokermr.sum"));
    }

    #[test]
    fn test_parse_correlation_fields() {
        let run_id = Uuid::new_v4();
        let mut fields = HashMap::new();
        fields.insert(FIELD_RUN_ID.to_string(), run_id.to_string().into_bytes());
        fields.insert(FIELD_SEQUENCE_INDEX.to_string(), b"4".to_vec());

        let correlation = parse_correlation(&fields).unwrap().unwrap();
        assert_eq!(correlation, Correlation::new(run_id, 4));

        fields.remove(FIELD_SEQUENCE_INDEX);
        assert!(parse_correlation(&fields).unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at BROKERMR_TEST_REDIS_URL"]
    async fn test_slow_consumer_keeps_its_delivery() {
        let url = std::env::var("BROKERMR_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let config = BrokerConfig {
            backend: crate::config::BrokerBackend::Redis,
            url: Some(url),
            key_prefix: format!("brokermr-test-{}:", Uuid::new_v4()),
            heartbeat_ttl: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let broker = RedisBroker::connect(&config).await.unwrap();
        broker.declare_queue("work").await.unwrap();
        broker
            .publish("work", Envelope::new(b"job".to_vec()))
            .await
            .unwrap();

        let mut slow = broker.consume("work", 1).await.unwrap();
        let delivery = slow.next().await.unwrap().unwrap();

        // Three TTLs pass without `slow` polling again
        let mut peer = broker.consume("work", 1).await.unwrap();
        let taken = tokio::time::timeout(Duration::from_millis(900), peer.next()).await;
        assert!(taken.is_err(), "a live consumer's delivery was requeued");

        slow.ack(delivery.tag).await.unwrap();
        broker.delete_queue("work").await.unwrap();
    }

    #[test]
    fn test_parse_correlation_rejects_bad_index() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_RUN_ID.to_string(), Uuid::new_v4().to_string().into_bytes());
        fields.insert(FIELD_SEQUENCE_INDEX.to_string(), b"-1".to_vec());
        assert!(parse_correlation(&fields).is_err());
    }
}
