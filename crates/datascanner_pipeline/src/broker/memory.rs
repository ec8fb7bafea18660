//! In-process broker for tests and single-process runs.

use super::{Broker, Delivery, RejectOutcome};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use datascanner_protocol::defaults::DEFAULT_REQUEUE_LIMIT;
use datascanner_protocol::{Message, Queue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone)]
struct Envelope {
    id: i64,
    body: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    ready: HashMap<Queue, VecDeque<Envelope>>,
    leased: HashMap<i64, (Queue, Envelope)>,
    dead: Vec<(Queue, Vec<u8>, String)>,
}

/// Queues held in memory. Nothing survives the process.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    requeue_limit: u32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEUE_LIMIT)
    }
}

impl MemoryBroker {
    pub fn new(requeue_limit: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            requeue_limit,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self, queues: &[Queue]) -> Option<Delivery> {
        let mut state = self.state();
        // Oldest first across the requested queues, as the durable broker does.
        let queue = queues
            .iter()
            .filter_map(|q| state.ready.get(q).and_then(VecDeque::front).map(|e| (e.id, *q)))
            .min()
            .map(|(_, q)| q)?;
        let envelope = state.ready.get_mut(&queue)?.pop_front()?;
        let delivery = Delivery {
            id: envelope.id,
            queue,
            body: envelope.body.clone(),
            attempts: envelope.attempts,
        };
        state.leased.insert(envelope.id, (queue, envelope));
        Some(delivery)
    }

    /// Messages waiting on `queue`, not counting leased ones.
    pub fn depth(&self, queue: Queue) -> usize {
        self.state().ready.get(&queue).map_or(0, VecDeque::len)
    }

    /// Removes and decodes everything waiting on `queue`.
    pub fn take_all(&self, queue: Queue) -> BrokerResult<Vec<Message>> {
        let drained: Vec<Envelope> = self
            .state()
            .ready
            .get_mut(&queue)
            .map(|ready| ready.drain(..).collect())
            .unwrap_or_default();
        drained
            .iter()
            .map(|envelope| Message::decode(queue, &envelope.body).map_err(BrokerError::from))
            .collect()
    }

    /// Dead-lettered bodies with the reason they were rejected.
    pub fn dead_letters(&self) -> Vec<(Queue, Vec<u8>, String)> {
        self.state().dead.clone()
    }

    /// Publish a raw body, bypassing encoding.
    pub fn publish_raw(&self, queue: Queue, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.state();
            state.next_id += 1;
            let envelope = Envelope {
                id: state.next_id,
                body: body.into(),
                attempts: 0,
            };
            state.ready.entry(queue).or_default().push_back(envelope);
        }
        self.arrivals.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &Message) -> BrokerResult<()> {
        let body = message.encode()?;
        self.publish_raw(message.queue(), body);
        Ok(())
    }

    async fn receive(&self, queues: &[Queue], wait: Duration) -> BrokerResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before looking, so an arrival in between still wakes us.
            let arrival = self.arrivals.notified();
            if let Some(delivery) = self.try_take(queues) {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, arrival).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.state()
            .leased
            .remove(&delivery.id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery.id))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<RejectOutcome> {
        let outcome = {
            let mut state = self.state();
            let (queue, mut envelope) = state
                .leased
                .remove(&delivery.id)
                .ok_or(BrokerError::UnknownDelivery(delivery.id))?;
            if requeue && envelope.attempts < self.requeue_limit {
                envelope.attempts += 1;
                state.ready.entry(queue).or_default().push_front(envelope);
                RejectOutcome::Requeued
            } else {
                warn!(id = envelope.id, queue = %queue, reason, "Message dead-lettered");
                state.dead.push((queue, envelope.body, reason.to_string()));
                RejectOutcome::DeadLettered
            }
        };
        if outcome == RejectOutcome::Requeued {
            self.arrivals.notify_waiters();
        }
        Ok(outcome)
    }

    async fn pending(&self) -> BrokerResult<u64> {
        let state = self.state();
        let ready: usize = state.ready.values().map(VecDeque::len).sum();
        Ok((ready + state.leased.len()) as u64)
    }
}
