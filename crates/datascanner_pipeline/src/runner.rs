//! Stage runner: the receive/process/publish/acknowledge loop.
//!
//! Each delivery is handled on its own task, at most `prefetch` at a time.
//! Outputs are published before the input is acknowledged, so a crash in
//! between leads to a redelivery and duplicate outputs, never to a lost
//! message.

use crate::broker::{Broker, Delivery, RejectOutcome};
use crate::error::BrokerResult;
use crate::stages::Stage;
use datascanner_protocol::defaults::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_PREFETCH};
use datascanner_protocol::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Counts of how deliveries were settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub published: u64,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    published: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }

    fn rejected(&self, outcome: RejectOutcome) {
        match outcome {
            RejectOutcome::Requeued => self.requeued.fetch_add(1, Ordering::Relaxed),
            RejectOutcome::DeadLettered => self.dead_lettered.fetch_add(1, Ordering::Relaxed),
        };
    }
}

pub struct StageRunner {
    id: String,
    stage: Arc<dyn Stage>,
    broker: Arc<dyn Broker>,
    prefetch: usize,
    poll_interval: Duration,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn Stage>, broker: Arc<dyn Broker>) -> Self {
        let id = format!("{}-{}", stage.name(), &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            id,
            stage,
            broker,
            prefetch: DEFAULT_PREFETCH,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    /// Deliveries processed concurrently. At least one.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consumes until `shutdown` turns true (or its sender goes away), then
    /// waits for the deliveries in flight.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> BrokerResult<RunnerStats> {
        let queues = self.stage.consumes();
        info!(
            runner = %self.id,
            queues = ?queues.iter().map(|q| q.as_str()).collect::<Vec<_>>(),
            input = queues.first().map(|q| q.shape()).unwrap_or("-"),
            prefetch = self.prefetch,
            "Stage runner started"
        );

        let permits = Arc::new(Semaphore::new(self.prefetch));
        let counters = Arc::new(Counters::default());
        let mut in_flight = JoinSet::new();
        let mut failure = None;

        while !*shutdown.borrow() {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(runner = %self.id, error = %err, "Delivery task failed");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = self.broker.receive(queues, self.poll_interval) => received,
            };
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    error!(runner = %self.id, error = %err, "Receive failed; stopping");
                    failure = Some(err);
                    break;
                }
            };

            in_flight.spawn(settle(
                Arc::clone(&self.stage),
                Arc::clone(&self.broker),
                Arc::clone(&counters),
                delivery,
                permit,
            ));
        }

        if !in_flight.is_empty() {
            info!(runner = %self.id, in_flight = in_flight.len(), "Waiting for deliveries in flight");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(runner = %self.id, error = %err, "Delivery task failed");
            }
        }

        let stats = counters.snapshot();
        info!(runner = %self.id, ?stats, "Stage runner stopped");
        match failure {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

/// Processes one delivery and settles it exactly once.
async fn settle(
    stage: Arc<dyn Stage>,
    broker: Arc<dyn Broker>,
    counters: Arc<Counters>,
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
) {
    let message = match Message::decode(delivery.queue, &delivery.body) {
        Ok(message) => message,
        Err(err) => {
            error!(stage = stage.name(), id = delivery.id, error = %err, "Rejecting undecodable message");
            reject(&*broker, &counters, &delivery, false, &err.to_string()).await;
            return;
        }
    };

    match stage.process(message).await {
        Ok(outputs) => {
            for output in &outputs {
                if let Err(err) = broker.publish(output).await {
                    error!(stage = stage.name(), id = delivery.id, error = %err, "Publish failed");
                    reject(&*broker, &counters, &delivery, true, &err.to_string()).await;
                    return;
                }
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            match broker.ack(&delivery).await {
                Ok(()) => {
                    debug!(stage = stage.name(), id = delivery.id, outputs = outputs.len(), "Acknowledged");
                    counters.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => warn!(stage = stage.name(), id = delivery.id, error = %err, "Acknowledge failed"),
            }
        }
        Err(err) => {
            error!(
                stage = stage.name(),
                id = delivery.id,
                attempts = delivery.attempts,
                retry = err.is_transient(),
                error = %err,
                "Rejecting message"
            );
            reject(&*broker, &counters, &delivery, err.is_transient(), &err.to_string()).await;
        }
    }
}

async fn reject(broker: &dyn Broker, counters: &Counters, delivery: &Delivery, requeue: bool, reason: &str) {
    match broker.reject(delivery, requeue, reason).await {
        Ok(outcome) => counters.rejected(outcome),
        Err(err) => warn!(id = delivery.id, error = %err, "Reject failed"),
    }
}

/// Runs `runners` until every queue of `broker` is empty and nothing is
/// leased, then stops them. Requires the work to have been published
/// before the call.
pub async fn run_until_drained(
    broker: Arc<dyn Broker>,
    runners: Vec<StageRunner>,
    check_interval: Duration,
) -> BrokerResult<Vec<RunnerStats>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(runners.len());
    for runner in runners {
        handles.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    let drained = loop {
        tokio::time::sleep(check_interval).await;
        match broker.pending().await {
            Ok(0) => break Ok(()),
            Ok(pending) => debug!(pending, "Waiting for queues to drain"),
            Err(err) => break Err(err),
        }
        if handles.iter().all(|handle| handle.is_finished()) {
            warn!("Every stage runner stopped before the queues drained");
            break Ok(());
        }
    };
    let _ = shutdown_tx.send(true);

    let mut stats = Vec::with_capacity(handles.len());
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(runner_stats)) => stats.push(runner_stats),
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(err) => error!(error = %err, "Stage runner panicked"),
        }
    }
    drained?;
    match failure {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::{StageError, StageResult};
    use async_trait::async_trait;
    use datascanner_protocol::{HandleMessage, Queue, ScanTag};
    use serde_json::json;

    /// Fails every message the way it was told to.
    struct Failing(StageError);

    #[async_trait]
    impl Stage for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn consumes(&self) -> &'static [Queue] {
            &[Queue::Handles]
        }

        async fn process(&self, _message: Message) -> StageResult<Vec<Message>> {
            Err(match &self.0 {
                StageError::Malformed(m) => StageError::malformed(m),
                StageError::Transient(m) => StageError::transient(m),
            })
        }
    }

    fn handle_message() -> Message {
        HandleMessage {
            scan_tag: ScanTag::new("test"),
            handle: json!({"type": "file", "path": "a.txt"}),
        }
        .into()
    }

    async fn run_failing(error: StageError, requeue_limit: u32) -> (Arc<MemoryBroker>, RunnerStats) {
        let broker = Arc::new(MemoryBroker::new(requeue_limit));
        broker.publish(&handle_message()).await.unwrap();
        let runner = StageRunner::new(Arc::new(Failing(error)), broker.clone() as Arc<dyn Broker>)
            .with_poll_interval(Duration::from_millis(10));
        let stats = run_until_drained(broker.clone(), vec![runner], Duration::from_millis(20))
            .await
            .unwrap();
        (broker, stats[0])
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_dead_lettered() {
        let (broker, stats) = run_failing(StageError::transient("share busy"), 2).await;
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_failures_are_not_retried() {
        let (broker, stats) = run_failing(StageError::malformed("bad handle"), 5).await;
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters()[0].2, "Malformed message (no retry): bad handle");
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dead_lettered() {
        let broker = Arc::new(MemoryBroker::default());
        broker.publish_raw(Queue::Handles, "{\"scan_tag\": 1}");
        let runner = StageRunner::new(
            Arc::new(Failing(StageError::transient("never reached"))),
            broker.clone() as Arc<dyn Broker>,
        );
        let stats = run_until_drained(broker.clone(), vec![runner], Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(stats[0].dead_lettered, 1);
        assert_eq!(stats[0].requeued, 0);
    }
}
