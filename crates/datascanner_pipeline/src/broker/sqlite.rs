//! Durable broker on the scanner database.
//!
//! Stages running as separate processes share one SQLite file. Receiving
//! polls, since SQLite has no way to wake a waiting reader.

use super::{Broker, Delivery, RejectOutcome};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use datascanner_db::ScannerDb;
use datascanner_protocol::defaults::{DEFAULT_LEASE_SECS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEUE_LIMIT};
use datascanner_protocol::{Message, Queue};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct SqliteBroker {
    db: ScannerDb,
    lease: Duration,
    requeue_limit: u32,
    poll_interval: Duration,
}

impl SqliteBroker {
    pub fn new(db: ScannerDb) -> Self {
        Self {
            db,
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    /// How long a received message stays hidden before it is redelivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_requeue_limit(mut self, limit: u32) -> Self {
        self.requeue_limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn db(&self) -> &ScannerDb {
        &self.db
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn publish(&self, message: &Message) -> BrokerResult<()> {
        let body = message.to_json()?.to_string();
        self.db.enqueue(message.queue().as_str(), &body).await?;
        Ok(())
    }

    async fn receive(&self, queues: &[Queue], wait: Duration) -> BrokerResult<Option<Delivery>> {
        let names: Vec<&str> = queues.iter().map(Queue::as_str).collect();
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.db.claim(&names, self.lease).await? {
                let queue: Queue = message.queue.parse()?;
                return Ok(Some(Delivery {
                    id: message.id,
                    queue,
                    body: message.body.into_bytes(),
                    attempts: message.attempts,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.db.ack(delivery.id).await.map_err(|err| match err {
            datascanner_db::DbError::NotFound(_) => BrokerError::UnknownDelivery(delivery.id),
            other => other.into(),
        })
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<RejectOutcome> {
        Ok(self
            .db
            .reject(delivery.id, requeue, reason, self.requeue_limit)
            .await?)
    }

    async fn pending(&self) -> BrokerResult<u64> {
        let mut total = 0;
        for queue in Queue::ALL {
            total += self.db.pending(queue.as_str()).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datascanner_protocol::{ProblemKind, ProblemMessage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_through_the_database() {
        let tmp = TempDir::new().unwrap();
        let db = ScannerDb::open(tmp.path().join("broker.db")).await.unwrap();
        let broker = SqliteBroker::new(db).with_poll_interval(Duration::from_millis(5));

        let problem = Message::Problem(ProblemMessage::new(ProblemKind::Unavailable, "share offline"));
        broker.publish(&problem).await.unwrap();
        assert_eq!(broker.pending().await.unwrap(), 1);

        let delivery = broker
            .receive(&Queue::EXPORTED, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.queue, Queue::Problems);
        assert_eq!(Message::decode(delivery.queue, &delivery.body).unwrap(), problem);

        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.pending().await.unwrap(), 0);
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
        assert!(broker
            .receive(&Queue::EXPORTED, Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }
}
