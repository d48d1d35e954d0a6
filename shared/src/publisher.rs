//! Drains the outbox to the broker on a fixed tick.

use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerWriter, OutboundMessage};
use crate::config::PublisherConfig;
use crate::error::OutboxError;
use crate::outbox::{retry_backoff, OutboxEvent, OutboxStore};

/// Counters for a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Published to the broker but not recorded as sent; these will be
    /// published again.
    pub mark_sent_errors: usize,
    /// The tick stopped early because of a shutdown request.
    pub interrupted: bool,
}

pub struct OutboxPublisher<S, B> {
    store: S,
    broker: B,
    config: PublisherConfig,
    max_attempts: Option<i32>,
}

impl<S, B> OutboxPublisher<S, B>
where
    S: OutboxStore,
    B: BrokerWriter,
{
    pub fn new(store: S, broker: B, config: PublisherConfig) -> Self {
        Self {
            store,
            broker,
            config,
            max_attempts: None,
        }
    }

    /// Must match the store's ceiling; used to report rows that stop being
    /// retried.
    pub fn with_max_attempts(mut self, max_attempts: Option<i32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox publisher started"
        );

        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(report) if report.claimed > 0 => info!(
                    claimed = report.claimed,
                    published = report.published,
                    failed = report.failed,
                    mark_sent_errors = report.mark_sent_errors,
                    "Outbox tick finished"
                ),
                Ok(_) => debug!("Outbox empty"),
                Err(e) => error!(error = %e, "Error processing outbox events"),
            }
        }

        info!("Outbox publisher stopped");
    }

    /// Claims one batch and publishes it in order. A shutdown request stops
    /// the batch between events, never during a publish.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, OutboxError> {
        if cancel.is_cancelled() {
            return Ok(TickReport {
                interrupted: true,
                ..TickReport::default()
            });
        }

        let batch = self.store.claim_batch(self.config.batch_size).await?;
        let mut report = TickReport {
            claimed: batch.len(),
            ..TickReport::default()
        };

        for event in &batch {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            self.publish_one(event, &mut report).await;
        }

        Ok(report)
    }

    async fn publish_one(&self, event: &OutboxEvent, report: &mut TickReport) {
        let message = OutboundMessage::from(event);

        match self.broker.send(&message).await {
            Ok(()) => match self.store.mark_sent(event.id).await {
                Ok(()) => {
                    report.published += 1;
                    info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        topic = %event.topic,
                        "Published outbox event"
                    );
                }
                Err(e) => {
                    report.mark_sent_errors += 1;
                    error!(
                        event_id = %event.id,
                        error = %e,
                        "Outbox event published but not marked sent; it will be published again"
                    );
                }
            },
            Err(publish_error) => {
                report.failed += 1;
                let reason = publish_error.to_string();
                let attempt = event.retry_count.saturating_add(1);

                if let Err(e) = self.store.mark_failed(event.id, &reason).await {
                    error!(event_id = %event.id, error = %e, "Failed to record outbox publish failure");
                    return;
                }

                if self.max_attempts.is_some_and(|max| attempt >= max) {
                    error!(
                        event_id = %event.id,
                        attempts = attempt,
                        error = %reason,
                        "Outbox event reached its retry ceiling and is parked"
                    );
                } else {
                    warn!(
                        event_id = %event.id,
                        attempt,
                        retry_in_secs = retry_backoff(attempt).num_seconds(),
                        error = %reason,
                        "Failed to publish outbox event"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryBroker, MemoryOutboxStore};
    use crate::outbox::{publish_in_tx, OutboxStatus};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn fixture() -> (MemoryOutboxStore, MemoryBroker, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap());
        let store = MemoryOutboxStore::new(Arc::new(clock.clone()));
        (store, MemoryBroker::new(), clock)
    }

    async fn enqueue(store: &MemoryOutboxStore, topic: &str, aggregate_id: &str) -> Uuid {
        let mut tx = store.begin();
        let id = publish_in_tx(
            &mut tx,
            topic,
            "employee",
            aggregate_id,
            "employee.created",
            format!("{{\"id\":\"{aggregate_id}\"}}").into_bytes(),
            None,
        )
        .await
        .unwrap();
        tx.commit();
        id
    }

    #[tokio::test]
    async fn publishes_in_order_and_marks_sent() {
        let (store, broker, clock) = fixture();
        let first = enqueue(&store, "hr.employee.lifecycle.v1", "e-1").await;
        clock.advance(chrono::Duration::milliseconds(5));
        let second = enqueue(&store, "hr.employee.lifecycle.v1", "e-1").await;

        let publisher = OutboxPublisher::new(store.clone(), broker.clone(), PublisherConfig::default());
        let report = publisher.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.published, 2);

        let sent = broker.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key, "e-1");
        assert_eq!(sent[0].payload, store.get(first).await.unwrap().unwrap().payload);
        assert_eq!(sent[1].payload, store.get(second).await.unwrap().unwrap().payload);
        assert!(store.rows().iter().all(|row| row.status == OutboxStatus::Sent));

        let again = publisher.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(again, TickReport::default());
        assert_eq!(broker.sent().len(), 2);
    }

    #[tokio::test]
    async fn failure_does_not_block_the_batch() {
        struct RejectTopic {
            inner: MemoryBroker,
            topic: &'static str,
        }

        #[async_trait]
        impl BrokerWriter for RejectTopic {
            async fn send(&self, message: &OutboundMessage) -> Result<(), crate::error::BrokerError> {
                if message.topic == self.topic {
                    return Err(crate::error::BrokerError::Publish {
                        topic: message.topic.clone(),
                        cause: "message too large".to_string(),
                    });
                }
                self.inner.send(message).await
            }
        }

        let (store, broker, clock) = fixture();
        let poisoned = enqueue(&store, "hr.poisoned.v1", "e-1").await;
        clock.advance(chrono::Duration::milliseconds(1));
        let healthy = enqueue(&store, "hr.employee.lifecycle.v1", "e-2").await;

        let publisher = OutboxPublisher::new(
            store.clone(),
            RejectTopic {
                inner: broker.clone(),
                topic: "hr.poisoned.v1",
            },
            PublisherConfig::default(),
        );
        let report = publisher.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!((report.published, report.failed), (1, 1));
        let failed = store.get(poisoned).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.error_message.unwrap().contains("message too large"));
        assert_eq!(store.get(healthy).await.unwrap().unwrap().status, OutboxStatus::Sent);
    }

    #[tokio::test]
    async fn mark_sent_failure_republishes() {
        struct FlakyMarkSent {
            inner: MemoryOutboxStore,
            failures_left: AtomicUsize,
        }

        #[async_trait]
        impl OutboxStore for FlakyMarkSent {
            async fn claim_batch(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
                self.inner.claim_batch(limit).await
            }
            async fn mark_sent(&self, id: Uuid) -> Result<(), OutboxError> {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(OutboxError::Pool("connection reset".to_string()));
                }
                self.inner.mark_sent(id).await
            }
            async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), OutboxError> {
                self.inner.mark_failed(id, reason).await
            }
            async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
                self.inner.get(id).await
            }
        }

        let (store, broker, _) = fixture();
        let id = enqueue(&store, "hr.employee.lifecycle.v1", "e-1").await;
        let publisher = OutboxPublisher::new(
            FlakyMarkSent {
                inner: store.clone(),
                failures_left: AtomicUsize::new(1),
            },
            broker.clone(),
            PublisherConfig::default(),
        );

        let first = publisher.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.mark_sent_errors, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, OutboxStatus::Pending);

        let second = publisher.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.published, 1);
        assert_eq!(broker.sent().len(), 2);
        assert_eq!(broker.sent()[0], broker.sent()[1]);
    }

    #[tokio::test]
    async fn storage_error_on_claim_ends_the_tick() {
        struct Unavailable;

        #[async_trait]
        impl OutboxStore for Unavailable {
            async fn claim_batch(&self, _: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
                Err(OutboxError::Pool("database unavailable".to_string()))
            }
            async fn mark_sent(&self, _: Uuid) -> Result<(), OutboxError> {
                unreachable!()
            }
            async fn mark_failed(&self, _: Uuid, _: &str) -> Result<(), OutboxError> {
                unreachable!()
            }
            async fn get(&self, _: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
                Ok(None)
            }
        }

        let broker = MemoryBroker::new();
        let publisher = OutboxPublisher::new(Unavailable, broker.clone(), PublisherConfig::default());

        let err = publisher.tick(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_storage());
        assert!(broker.sent().is_empty());
    }

    #[tokio::test]
    async fn cancelled_tick_claims_nothing() {
        let (store, broker, _) = fixture();
        enqueue(&store, "hr.employee.lifecycle.v1", "e-1").await;
        let publisher = OutboxPublisher::new(store.clone(), broker.clone(), PublisherConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = publisher.tick(&cancel).await.unwrap();

        assert!(report.interrupted);
        assert!(broker.sent().is_empty());
    }

    #[tokio::test]
    async fn run_returns_on_cancel() {
        let (store, broker, _) = fixture();
        enqueue(&store, "hr.employee.lifecycle.v1", "e-1").await;
        let publisher = Arc::new(OutboxPublisher::new(
            store.clone(),
            broker.clone(),
            PublisherConfig::default(),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        // The first interval tick fires immediately.
        while broker.sent().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(store.rows()[0].status, OutboxStatus::Sent);
    }
}
