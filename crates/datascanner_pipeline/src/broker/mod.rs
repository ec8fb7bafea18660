//! Queue brokers.
//!
//! A broker moves encoded messages between stages with at-least-once
//! delivery: a received message stays leased until it is acknowledged or
//! rejected, and a rejected one is either redelivered or dead-lettered.

mod memory;
mod sqlite;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use crate::error::BrokerResult;
use async_trait::async_trait;
pub use datascanner_db::RejectOutcome;
use datascanner_protocol::{Message, Queue};
use std::time::Duration;

/// One received message, to be settled exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub queue: Queue,
    pub body: Vec<u8>,
    /// Times this message was rejected and requeued before.
    pub attempts: u32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message onto the queue its shape belongs on.
    async fn publish(&self, message: &Message) -> BrokerResult<()>;

    /// Take the oldest message available on any of `queues`, waiting up to
    /// `wait` for one to arrive.
    async fn receive(&self, queues: &[Queue], wait: Duration) -> BrokerResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Reject a delivery. `requeue` asks for redelivery; the broker may
    /// still dead-letter it once it has been rejected too often.
    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<RejectOutcome>;

    /// Messages published but not yet acknowledged, across all queues.
    async fn pending(&self) -> BrokerResult<u64>;
}
