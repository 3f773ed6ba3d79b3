use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Priority, QueueMessage};

/// A claimed message. It stays invisible to other consumers until acked,
/// rescheduled, or its visibility timeout lapses.
///
/// `(id, delivery_count)` identifies the lease: once the message is claimed
/// again, acks and reschedules carrying the older count are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    pub queue: String,
    pub message: QueueMessage,
    pub priority: Priority,
    /// How many times this message has been claimed, including this one.
    pub delivery_count: u32,
}

/// At-least-once message broker with priorities and delayed delivery.
pub trait MessageBroker: Send + Sync + Clone {
    /// Enqueue a message, visible after `delay`.
    fn publish(
        &self,
        queue: &str,
        message: &QueueMessage,
        priority: Priority,
        delay: Duration,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Claim the highest-priority visible message on `queue`.
    fn claim(
        &self,
        queue: &str,
        consumer: &str,
    ) -> impl Future<Output = Result<Option<Delivery>, AppError>> + Send;

    /// Remove a delivered message. Returns false if it is gone or its lease
    /// has passed to another consumer.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Atomically ack a delivery and make it visible again after `delay`
    /// with its `attempt` field updated. Same lease rule as `ack`.
    fn reschedule(
        &self,
        delivery: &Delivery,
        attempt: u32,
        delay: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Messages on `queue`, visible or not.
    fn depth(&self, queue: &str) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Longest delay the in-memory broker will schedule.
const MAX_DELAY: Duration = Duration::from_secs(30 * 86_400);

fn visible_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(MAX_DELAY)
}

#[derive(Debug)]
struct Slot {
    queue: String,
    message: QueueMessage,
    priority: Priority,
    visible_at: Instant,
    seq: u64,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    slots: HashMap<Uuid, Slot>,
    next_seq: u64,
}

/// In-process broker for single-node deployments and tests.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            visibility_timeout,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned broker mutex");
            poisoned.into_inner()
        })
    }
}

impl BrokerState {
    /// The slot behind `delivery`, if that lease is still the current one.
    fn leased(&mut self, delivery: &Delivery) -> Option<&mut Slot> {
        self.slots
            .get_mut(&delivery.id)
            .filter(|slot| slot.delivery_count == delivery.delivery_count)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MessageBroker for MemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        message: &QueueMessage,
        priority: Priority,
        delay: Duration,
    ) -> Result<Uuid, AppError> {
        let mut state = self.lock_inner();
        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.insert(
            id,
            Slot {
                queue: queue.to_string(),
                message: message.clone(),
                priority,
                visible_at: visible_after(delay),
                seq,
                delivery_count: 0,
            },
        );
        Ok(id)
    }

    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, AppError> {
        let mut state = self.lock_inner();
        let now = Instant::now();
        let next = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.queue == queue && slot.visible_at <= now)
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .weight()
                    .cmp(&a.priority.weight())
                    .then(a.visible_at.cmp(&b.visible_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(slot) = state.slots.get_mut(&id) else {
            return Ok(None);
        };
        slot.visible_at = visible_after(self.visibility_timeout);
        slot.delivery_count += 1;
        tracing::trace!(%queue, %consumer, delivery_id = %id, "Message claimed");

        Ok(Some(Delivery {
            id,
            queue: slot.queue.clone(),
            message: slot.message.clone(),
            priority: slot.priority,
            delivery_count: slot.delivery_count,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let mut state = self.lock_inner();
        if state.leased(delivery).is_none() {
            return Ok(false);
        }
        Ok(state.slots.remove(&delivery.id).is_some())
    }

    async fn reschedule(
        &self,
        delivery: &Delivery,
        attempt: u32,
        delay: Duration,
    ) -> Result<bool, AppError> {
        let mut state = self.lock_inner();
        match state.leased(delivery) {
            Some(slot) => {
                slot.message.attempt = attempt;
                slot.visible_at = visible_after(delay);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64, AppError> {
        let state = self.lock_inner();
        Ok(state.slots.values().filter(|s| s.queue == queue).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Store;

    fn message(app_id: &str) -> QueueMessage {
        QueueMessage {
            job_id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            store: Store::PlayStore,
            attempt: 0,
            force_refresh: false,
        }
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let broker = MemoryBroker::default();
        broker
            .publish("q", &message("com.a.batch"), Priority::Batch, Duration::ZERO)
            .await
            .unwrap();
        broker
            .publish("q", &message("com.a.first"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();
        broker
            .publish("q", &message("com.a.second"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();

        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some(d) = broker.claim("q", "w1").await.unwrap() {
                out.push(d.message.app_id.clone());
                broker.ack(&d).await.unwrap();
            }
            out
        };
        assert_eq!(order, ["com.a.first", "com.a.second", "com.a.batch"]);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let broker = MemoryBroker::default();
        broker
            .publish("playstore", &message("com.a.b"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();
        assert!(broker.claim("appstore", "w1").await.unwrap().is_none());
        assert_eq!(broker.depth("playstore").await.unwrap(), 1);
        assert_eq!(broker.depth("appstore").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_publish() {
        let broker = MemoryBroker::default();
        broker
            .publish("q", &message("com.a.b"), Priority::Interactive, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(broker.claim("q", "w1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(broker.claim("q", "w1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker
            .publish("q", &message("com.a.b"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();

        let first = broker.claim("q", "w1").await.unwrap().unwrap();
        assert!(broker.claim("q", "w2").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = broker.claim("q", "w2").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_updates_attempt_and_delay() {
        let broker = MemoryBroker::default();
        broker
            .publish("q", &message("com.a.b"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();
        let delivery = broker.claim("q", "w1").await.unwrap().unwrap();

        assert!(broker
            .reschedule(&delivery, 1, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(broker.claim("q", "w1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(60)).await;
        let redelivered = broker.claim("q", "w1").await.unwrap().unwrap();
        assert_eq!(redelivered.message.attempt, 1);

        assert!(broker.ack(&redelivered).await.unwrap());
        assert!(!broker.ack(&redelivered).await.unwrap());
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_cannot_ack_or_reschedule() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker
            .publish("q", &message("com.a.b"), Priority::Interactive, Duration::ZERO)
            .await
            .unwrap();
        let stale = broker.claim("q", "w1").await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let current = broker.claim("q", "w2").await.unwrap().unwrap();

        assert!(!broker.reschedule(&stale, 1, Duration::ZERO).await.unwrap());
        assert!(!broker.ack(&stale).await.unwrap());
        assert_eq!(broker.depth("q").await.unwrap(), 1);

        assert!(broker.ack(&current).await.unwrap());
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_is_clamped() {
        let broker = MemoryBroker::default();
        broker
            .publish("q", &message("com.a.b"), Priority::Interactive, Duration::MAX)
            .await
            .unwrap();
        assert!(broker.claim("q", "w1").await.unwrap().is_none());
        assert_eq!(broker.depth("q").await.unwrap(), 1);
    }
}
