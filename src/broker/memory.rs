//! In-process broker
//!
//! Queues live in a shared map guarded by a std mutex so consumers can
//! return their deliveries from `Drop`. Waiting consumers park on a per-queue
//! [`Notify`] that is signalled whenever messages become ready.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use super::error::{BrokerError, BrokerResult};
use super::{Broker, Consumer, Delivery, DeliveryTag, Envelope};

#[derive(Debug, Clone)]
struct StoredMessage {
    envelope: Envelope,
    deliveries: u32,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct Shared {
    queues: HashMap<String, QueueState>,
    next_tag: DeliveryTag,
    closed: bool,
}

/// In-memory broker with ack and redelivery semantics
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    /// Close every consumer stream, as a lost broker connection would
    pub fn close(&self) {
        let mut shared = self.lock();
        shared.closed = true;
        for queue in shared.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    /// Number of ready (not in-flight) messages in a queue
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    /// Remove and return every ready message of a queue
    pub fn drain(&self, name: &str) -> Vec<Envelope> {
        self.lock()
            .queues
            .get_mut(name)
            .map(|q| q.ready.drain(..).map(|m| m.envelope).collect())
            .unwrap_or_default()
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(BrokerError::disconnected("memory broker is closed"));
        }
        shared
            .queues
            .entry(name.to_string())
            .or_insert_with(QueueState::new);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        let name = format!("reply.{}", Uuid::new_v4());
        self.declare_queue(&name).await?;
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        let mut shared = self.lock();
        if let Some(queue) = shared.queues.remove(name) {
            debug!(queue = name, dropped = queue.ready.len(), "Deleted queue");
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> BrokerResult<()> {
        let mut shared = self.lock();
        if shared.closed {
            return Err(BrokerError::disconnected("memory broker is closed"));
        }
        let state = shared
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue))?;
        state.ready.push_back(StoredMessage {
            envelope,
            deliveries: 0,
        });
        state.notify.notify_waiters();
        trace!(queue, depth = state.ready.len(), "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> BrokerResult<Box<dyn Consumer>> {
        if prefetch == 0 {
            return Err(BrokerError::configuration("prefetch must be at least 1"));
        }
        let shared = self.lock();
        if shared.closed {
            return Err(BrokerError::disconnected("memory broker is closed"));
        }
        let state = shared
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::queue_not_found(queue))?;

        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            notify: Arc::clone(&state.notify),
            prefetch,
            unacked: Vec::new(),
        }))
    }
}

/// Consumer over a [`MemoryBroker`] queue
pub struct MemoryConsumer {
    shared: Arc<Mutex<Shared>>,
    queue: String,
    notify: Arc<Notify>,
    prefetch: usize,
    unacked: Vec<(DeliveryTag, StoredMessage)>,
}

enum Poll {
    Ready(Delivery),
    Closed,
    Wait,
}

impl MemoryConsumer {
    fn try_take(&mut self) -> Poll {
        let mut shared = lock_shared(&self.shared);
        if shared.closed {
            return Poll::Closed;
        }
        if self.unacked.len() >= self.prefetch {
            return Poll::Wait;
        }

        let tag = shared.next_tag + 1;
        let Some(queue) = shared.queues.get_mut(&self.queue) else {
            return Poll::Closed;
        };
        let Some(mut message) = queue.ready.pop_front() else {
            return Poll::Wait;
        };
        shared.next_tag = tag;

        message.deliveries += 1;
        let delivery = Delivery {
            tag,
            envelope: message.envelope.clone(),
            delivery_count: message.deliveries,
        };
        self.unacked.push((tag, message));
        Poll::Ready(delivery)
    }

    /// Push unacknowledged messages back to the head of the queue, oldest first
    fn requeue_unacked(&mut self) -> usize {
        let pending = std::mem::take(&mut self.unacked);
        let count = pending.len();
        if count == 0 {
            return 0;
        }

        let mut shared = lock_shared(&self.shared);
        if let Some(queue) = shared.queues.get_mut(&self.queue) {
            for (_, message) in pending.into_iter().rev() {
                queue.ready.push_front(message);
            }
            queue.notify.notify_waiters();
        }
        count
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> BrokerResult<Option<Delivery>> {
        let notify = Arc::clone(&self.notify);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Poll::Ready(delivery) => return Ok(Some(delivery)),
                Poll::Closed => return Ok(None),
                Poll::Wait => notified.await,
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> BrokerResult<()> {
        let position = self
            .unacked
            .iter()
            .position(|(t, _)| *t == tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        self.unacked.remove(position);
        Ok(())
    }

    async fn release(&mut self) -> BrokerResult<()> {
        let count = self.requeue_unacked();
        if count > 0 {
            debug!(queue = %self.queue, count, "Released unacknowledged deliveries");
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.requeue_unacked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with_queue(name: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queue(name).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_and_ack() {
        let broker = broker_with_queue("work").await;
        broker
            .publish("work", Envelope::new(b"one".to_vec()))
            .await
            .unwrap();

        let mut consumer = broker.consume("work", 1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.payload, b"one");
        assert_eq!(delivery.delivery_count, 1);
        assert!(!delivery.redelivered());

        consumer.ack(delivery.tag).await.unwrap();
        drop(consumer);
        assert_eq!(broker.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn test_drop_without_ack_redelivers() {
        let broker = broker_with_queue("work").await;
        broker
            .publish("work", Envelope::new(b"job".to_vec()))
            .await
            .unwrap();

        {
            let mut consumer = broker.consume("work", 1).await.unwrap();
            let _ = consumer.next().await.unwrap().unwrap();
        }

        let mut consumer = broker.consume("work", 1).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 2);
        assert!(delivery.redelivered());
    }

    #[tokio::test]
    async fn test_release_keeps_order() {
        let broker = broker_with_queue("work").await;
        for payload in [b"a", b"b", b"c"] {
            broker
                .publish("work", Envelope::new(payload.to_vec()))
                .await
                .unwrap();
        }

        let mut consumer = broker.consume("work", 2).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.envelope.payload, b"a");
        assert_eq!(second.envelope.payload, b"b");

        consumer.release().await.unwrap();
        let again = consumer.next().await.unwrap().unwrap();
        assert_eq!(again.envelope.payload, b"a");
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_prefetch_limits_outstanding_deliveries() {
        let broker = broker_with_queue("work").await;
        for _ in 0..2 {
            broker
                .publish("work", Envelope::new(vec![1]))
                .await
                .unwrap();
        }

        let mut consumer = broker.consume("work", 1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(blocked.is_err());

        consumer.ack(first.tag).await.unwrap();
        assert!(consumer.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let broker = broker_with_queue("work").await;
        let mut consumer = broker.consume("work", 1).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("work", Envelope::new(b"late".to_vec()))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.payload, b"late");
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let broker = broker_with_queue("work").await;
        let mut consumer = broker.consume("work", 1).await.unwrap();
        broker.close();
        assert!(consumer.next().await.unwrap().is_none());
        assert!(broker
            .publish("work", Envelope::new(vec![]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_queue_and_tag() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish("missing", Envelope::new(vec![]))
            .await
            .unwrap_err();
        assert!(err.is_queue_not_found());

        broker.declare_queue("work").await.unwrap();
        let mut consumer = broker.consume("work", 1).await.unwrap();
        assert!(matches!(
            consumer.ack(99).await,
            Err(BrokerError::UnknownDelivery(99))
        ));
    }

    #[tokio::test]
    async fn test_reply_queues_are_unique() {
        let broker = MemoryBroker::new();
        let a = broker.declare_reply_queue().await.unwrap();
        let b = broker.declare_reply_queue().await.unwrap();
        assert_ne!(a, b);

        broker.delete_queue(&a).await.unwrap();
        assert_eq!(broker.queue_depth(&a), None);
    }
}
