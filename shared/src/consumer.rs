//! At-least-once consumer loop: decode, apply the effect, then commit.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{InboundMessage, MessageSource};
use crate::config::ConsumerConfig;
use crate::error::{BrokerError, DomainError};
use crate::events::DomainEvent;

/// Applies the business effect of one event.
///
/// Implementations report a repeated effect as
/// [`DomainError::DuplicateEffect`]; every other error makes the consumer
/// retry the same message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: DomainEvent;

    async fn handle(&self, event: Self::Event) -> Result<(), DomainError>;
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Effect applied, offset committed.
    Committed,
    /// Effect already existed, offset committed.
    Duplicate,
    /// Decoded but not an event this consumer handles, offset committed.
    Skipped,
    /// Undecodable, offset committed.
    Poison,
    /// Effect failed, offset not committed; the message is fetched again.
    Retry,
}

pub struct EventConsumer<S, H> {
    source: S,
    handler: H,
    config: ConsumerConfig,
    /// A failed message whose rewind did not go through. Nothing is fetched
    /// until it does, so the group offset never moves past it.
    unrewound: Option<InboundMessage>,
}

impl<S, H> EventConsumer<S, H>
where
    S: MessageSource,
    H: EventHandler,
{
    pub fn new(source: S, handler: H, config: ConsumerConfig) -> Self {
        Self {
            source,
            handler,
            config,
            unrewound: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            group = %self.config.group_id,
            topic = %self.config.topic,
            "Starting consumer loop"
        );

        loop {
            if let Err(e) = self.settle_rewind().await {
                error!(error = %e, "Still unable to rewind to the failed message");
                if self.pause(&cancel).await {
                    break;
                }
                continue;
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch() => fetched,
            };

            let outcome = match fetched {
                Ok(message) => self.process(message).await,
                Err(e) => {
                    error!(error = %e, "Error receiving message");
                    Outcome::Retry
                }
            };

            if outcome == Outcome::Retry && self.pause(&cancel).await {
                break;
            }
        }

        info!(group = %self.config.group_id, "Consumer loop ended");
    }

    /// Fetches and processes exactly one message. Fails without fetching
    /// while an earlier failed message could not be rewound.
    pub async fn process_next(&mut self) -> Result<Outcome, BrokerError> {
        self.settle_rewind().await?;
        let message = self.source.fetch().await?;
        Ok(self.process(message).await)
    }

    pub async fn process(&mut self, message: InboundMessage) -> Outcome {
        let outcome = match self.decode(&message) {
            Err(reason) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %reason,
                    "Skipping undecodable message"
                );
                Outcome::Poison
            }
            Ok(event) if event.event_type() != <H::Event as DomainEvent>::EVENT_TYPE => {
                debug!(
                    offset = message.offset,
                    event_type = %event.event_type(),
                    "Ignoring event type not handled by this consumer"
                );
                Outcome::Skipped
            }
            Ok(event) => {
                let aggregate_id = event.aggregate_id();
                match self.handler.handle(event).await {
                    Ok(()) => {
                        debug!(offset = message.offset, %aggregate_id, "Event processed");
                        Outcome::Committed
                    }
                    Err(DomainError::DuplicateEffect(key)) => {
                        warn!(
                            offset = message.offset,
                            %aggregate_id,
                            key = %key,
                            "Effect already applied, treating as processed"
                        );
                        Outcome::Duplicate
                    }
                    Err(DomainError::Failed(e)) => {
                        error!(
                            offset = message.offset,
                            %aggregate_id,
                            error = %e,
                            "Handler failed, message will be redelivered"
                        );
                        Outcome::Retry
                    }
                }
            }
        };

        if outcome == Outcome::Retry {
            if let Err(e) = self.source.rewind(&message).await {
                error!(error = %e, "Failed to rewind to the failed message");
                self.unrewound = Some(message);
            }
        } else if let Err(e) = self.source.commit(&message).await {
            // Left uncommitted, the message comes back after a restart or
            // rebalance and is absorbed as a duplicate.
            error!(error = %e, "Error committing message");
        }

        outcome
    }

    /// Retries a rewind that failed earlier.
    async fn settle_rewind(&mut self) -> Result<(), BrokerError> {
        if let Some(message) = &self.unrewound {
            self.source.rewind(message).await?;
            info!(offset = message.offset, "Rewound to the failed message");
            self.unrewound = None;
        }
        Ok(())
    }

    fn decode(&self, message: &InboundMessage) -> Result<H::Event, String> {
        let payload = message
            .payload
            .as_deref()
            .filter(|payload| !payload.is_empty())
            .ok_or_else(|| "empty payload".to_string())?;
        H::Event::decode(payload).map_err(|e| e.to_string())
    }

    /// Returns true when shutdown was requested during the pause.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.retry_delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EmployeeCreated, EMPLOYEE_LIFECYCLE_TOPIC};
    use crate::memory::{MemoryBroker, MemorySource};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    const GROUP: &str = "test-employee-salary";

    /// Fails the first `failures` calls, then records each employee once.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Uuid>>,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        type Event = EmployeeCreated;

        async fn handle(&self, event: EmployeeCreated) -> Result<(), DomainError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(anyhow::anyhow!("database is restarting").into());
                }
            }
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&event.employee_id) {
                return Err(DomainError::DuplicateEffect("employee".to_string()));
            }
            seen.push(event.employee_id);
            Ok(())
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::new(GROUP, EMPLOYEE_LIFECYCLE_TOPIC)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    fn consumer(broker: &MemoryBroker, handler: Recorder) -> EventConsumer<MemorySource, Recorder> {
        EventConsumer::new(broker.subscribe(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), handler, config())
    }

    /// Rejects the first `seek_failures` rewinds, like a client that lost
    /// its partition assignment for a moment.
    struct StuckSeek {
        inner: MemorySource,
        seek_failures: usize,
    }

    #[async_trait]
    impl MessageSource for StuckSeek {
        async fn fetch(&mut self) -> Result<InboundMessage, BrokerError> {
            self.inner.fetch().await
        }

        async fn commit(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
            self.inner.commit(message).await
        }

        async fn rewind(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
            if self.seek_failures > 0 {
                self.seek_failures -= 1;
                return Err(BrokerError::Seek {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    cause: "partition not assigned".to_string(),
                });
            }
            self.inner.rewind(message).await
        }
    }

    fn employee_created(employee_id: Uuid) -> Vec<u8> {
        EmployeeCreated::new(employee_id, Uuid::new_v4(), None, Utc::now())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_is_committed() {
        let broker = MemoryBroker::new();
        let employee_id = Uuid::new_v4();
        let body = employee_created(employee_id);
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &body);
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &body);

        let mut consumer = consumer(&broker, Recorder::default());

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Committed);
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Duplicate);
        assert_eq!(consumer.handler().seen.lock().unwrap().len(), 1);
        assert_eq!(broker.lag(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), 0);
    }

    #[tokio::test]
    async fn poison_is_skipped_and_committed() {
        let broker = MemoryBroker::new();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, b"\x00\x01 definitely not json");
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, b"");
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(Uuid::new_v4()));

        let mut consumer = consumer(&broker, Recorder::default());

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Poison);
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Poison);
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Committed);
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), Some(3));
    }

    #[tokio::test]
    async fn domain_failure_is_redelivered_until_it_succeeds() {
        let broker = MemoryBroker::new();
        let employee_id = Uuid::new_v4();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(employee_id));

        let handler = Recorder::default();
        *handler.failures.lock().unwrap() = 2;
        let mut consumer = consumer(&broker, handler);

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Retry);
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), None);
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Retry);
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Committed);

        assert_eq!(*consumer.handler().seen.lock().unwrap(), vec![employee_id]);
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), Some(1));
    }

    #[tokio::test]
    async fn failed_rewind_blocks_fetch_until_it_succeeds() {
        let broker = MemoryBroker::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(first));
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(second));

        let handler = Recorder::default();
        *handler.failures.lock().unwrap() = 1;
        let source = StuckSeek {
            inner: broker.subscribe(GROUP, EMPLOYEE_LIFECYCLE_TOPIC),
            seek_failures: 2,
        };
        let mut consumer = EventConsumer::new(source, handler, config());

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Retry);
        assert!(matches!(
            consumer.process_next().await,
            Err(BrokerError::Seek { offset: 0, .. })
        ));
        assert!(consumer.handler().seen.lock().unwrap().is_empty());
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), None);

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Committed);
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), Some(1));
        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Committed);

        assert_eq!(*consumer.handler().seen.lock().unwrap(), vec![first, second]);
        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), Some(2));
    }

    #[tokio::test]
    async fn run_keeps_retrying_the_rewind_instead_of_skipping_ahead() {
        let broker = MemoryBroker::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(first));
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(second));

        let handler = Recorder::default();
        *handler.failures.lock().unwrap() = 1;
        let source = StuckSeek {
            inner: broker.subscribe(GROUP, EMPLOYEE_LIFECYCLE_TOPIC),
            seek_failures: 3,
        };
        let consumer = EventConsumer::new(source, handler, config());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(consumer.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.lag(GROUP, EMPLOYEE_LIFECYCLE_TOPIC) > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("consumer did not drain the topic");
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(broker.committed_offset(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), Some(2));
    }

    #[tokio::test]
    async fn other_event_types_are_skipped() {
        let broker = MemoryBroker::new();
        let mut updated = EmployeeCreated::new(Uuid::new_v4(), Uuid::new_v4(), None, Utc::now());
        updated.event_type = "employee.updated".to_string();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &updated.encode().unwrap());

        let mut consumer = consumer(&broker, Recorder::default());

        assert_eq!(consumer.process_next().await.unwrap(), Outcome::Skipped);
        assert!(consumer.handler().seen.lock().unwrap().is_empty());
        assert_eq!(broker.lag(GROUP, EMPLOYEE_LIFECYCLE_TOPIC), 0);
    }

    #[tokio::test]
    async fn run_stops_before_the_next_fetch() {
        let broker = MemoryBroker::new();
        broker.inject(EMPLOYEE_LIFECYCLE_TOPIC, None, &employee_created(Uuid::new_v4()));
        let consumer = consumer(&broker, Recorder::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(consumer.run(cancel.clone()));
        while broker.lag(GROUP, EMPLOYEE_LIFECYCLE_TOPIC) > 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }
}
