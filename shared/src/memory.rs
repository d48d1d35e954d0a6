//! In-process outbox store and broker with the same contracts as the
//! Postgres and Kafka implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::broker::{BrokerWriter, InboundMessage, MessageSource, OutboundMessage};
use crate::clock::Clock;
use crate::error::{BrokerError, OutboxError};
use crate::outbox::{
    retry_backoff, truncate_error, NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore,
    OutboxWriter,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct MemoryOutboxStore {
    rows: Arc<Mutex<Vec<OutboxEvent>>>,
    clock: Arc<dyn Clock>,
    max_attempts: Option<i32>,
}

impl MemoryOutboxStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            clock,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<i32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Opens a transaction; rows enlisted through it appear on `commit` and
    /// are discarded if it is dropped.
    pub fn begin(&self) -> MemoryTx {
        MemoryTx {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    /// All rows in insertion order.
    pub fn rows(&self) -> Vec<OutboxEvent> {
        lock(&self.rows).clone()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        if row.status != OutboxStatus::Sent {
            apply(row);
        }
        Ok(())
    }
}

pub struct MemoryTx {
    store: MemoryOutboxStore,
    staged: Vec<NewOutboxEvent>,
}

impl MemoryTx {
    pub fn commit(self) {
        let now = self.store.clock.now();
        let mut rows = lock(&self.store.rows);
        rows.extend(self.staged.into_iter().map(|event| event.into_row(now)));
    }
}

#[async_trait]
impl OutboxWriter for MemoryTx {
    async fn enlist(&mut self, event: NewOutboxEvent) -> Result<(), OutboxError> {
        event.validate()?;
        self.staged.push(event);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_batch(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let max_attempts = self.max_attempts.unwrap_or(i32::MAX);
        let mut claimable: Vec<OutboxEvent> = lock(&self.rows)
            .iter()
            .filter(|row| row.is_claimable(now) && row.retry_count < max_attempts)
            .cloned()
            .collect();

        claimable.sort_by_key(|row| row.created_at);
        claimable.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(claimable)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), OutboxError> {
        let now = self.clock.now();
        self.update(id, |row| {
            row.status = OutboxStatus::Sent;
            row.processed_at = Some(now);
            row.error_message = None;
            row.next_retry_at = None;
            row.updated_at = now;
        })
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let reason = truncate_error(reason);
        self.update(id, |row| {
            row.retry_count = row.retry_count.saturating_add(1);
            row.status = OutboxStatus::Failed;
            row.error_message = Some(reason);
            row.next_retry_at = Some(now + retry_backoff(row.retry_count));
            row.updated_at = now;
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        Ok(lock(&self.rows).iter().find(|row| row.id == id).cloned())
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<InboundMessage>>,
    committed: HashMap<(String, String), i64>,
    sent: Vec<OutboundMessage>,
    unavailable: bool,
}

/// A single-partition broker. Each topic is an append-only log; each
/// consumer group keeps its own committed offset.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every send fails.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).unavailable = !available;
    }

    /// Every message accepted so far, in send order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.state).sent.clone()
    }

    /// Appends raw bytes, bypassing the outbox.
    pub fn inject(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) {
        self.append(topic, key.map(<[u8]>::to_vec), Some(payload.to_vec()), Vec::new());
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        lock(&self.state)
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// Messages the group has not committed yet.
    pub fn lag(&self, group: &str, topic: &str) -> i64 {
        let state = lock(&self.state);
        let end = state.topics.get(topic).map_or(0, |log| log.len() as i64);
        let committed = state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0);
        end - committed
    }

    /// A source positioned at the group's committed offset, or at the start
    /// of the log when the group has never committed.
    pub fn subscribe(&self, group: &str, topic: &str) -> MemorySource {
        let position = self.committed_offset(group, topic).unwrap_or(0);
        MemorySource {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            position,
        }
    }

    fn append(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        headers: Vec<(String, Vec<u8>)>,
    ) {
        {
            let mut state = lock(&self.state);
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(InboundMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key,
                payload,
                headers,
            });
        }
        self.appended.notify_waiters();
    }
}

#[async_trait]
impl BrokerWriter for MemoryBroker {
    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        if lock(&self.state).unavailable {
            return Err(BrokerError::Publish {
                topic: message.topic.clone(),
                cause: "broker transport failure".to_string(),
            });
        }

        let headers = message
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), value.as_bytes().to_vec()))
            .collect();
        self.append(
            &message.topic,
            Some(message.key.as_bytes().to_vec()),
            Some(message.payload.clone()),
            headers,
        );
        lock(&self.state).sent.push(message.clone());
        Ok(())
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    group: String,
    topic: String,
    position: i64,
}

impl MemorySource {
    fn next_message(&self) -> Option<InboundMessage> {
        let state = lock(&self.broker.state);
        state
            .topics
            .get(&self.topic)
            .and_then(|log| log.get(usize::try_from(self.position).ok()?))
            .cloned()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch(&mut self) -> Result<InboundMessage, BrokerError> {
        loop {
            let appended = self.broker.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            if let Some(message) = self.next_message() {
                self.position = message.offset + 1;
                return Ok(message);
            }
            appended.await;
        }
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut state = lock(&self.broker.state);
        let committed = state
            .committed
            .entry((self.group.clone(), message.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(message.offset + 1);
        Ok(())
    }

    async fn rewind(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.position = message.offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::outbox::publish_in_tx;
    use chrono::{Duration, TimeZone, Utc};

    fn store() -> (MemoryOutboxStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap());
        (MemoryOutboxStore::new(Arc::new(clock.clone())), clock)
    }

    async fn enqueue(store: &MemoryOutboxStore, aggregate_id: &str) -> Uuid {
        let mut tx = store.begin();
        let id = publish_in_tx(
            &mut tx,
            "hr.employee.lifecycle.v1",
            "employee",
            aggregate_id,
            "employee.created",
            b"{}".to_vec(),
            None,
        )
        .await
        .unwrap();
        tx.commit();
        id
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_row() {
        let (store, _) = store();
        {
            let mut tx = store.begin();
            publish_in_tx(&mut tx, "t", "employee", "e-1", "employee.created", b"{}".to_vec(), None)
                .await
                .unwrap();
        }
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_before_staging() {
        let (store, _) = store();
        let mut tx = store.begin();
        let err = publish_in_tx(&mut tx, "", "employee", "e-1", "employee.created", b"{}".to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidEvent(_)));
        tx.commit();
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn claim_of_zero_is_empty() {
        let (store, _) = store();
        enqueue(&store, "e-1").await;
        assert!(store.claim_batch(0).await.unwrap().is_empty());
        assert_eq!(store.claim_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_read_only() {
        let (store, clock) = store();
        let first = enqueue(&store, "e-1").await;
        clock.advance(Duration::seconds(1));
        let second = enqueue(&store, "e-1").await;
        clock.advance(Duration::seconds(1));
        let third = enqueue(&store, "e-2").await;

        let claimed: Vec<Uuid> = store.claim_batch(2).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(claimed, vec![first, second]);

        let again: Vec<Uuid> = store.claim_batch(5).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(again, vec![first, second, third]);
    }

    #[tokio::test]
    async fn failed_rows_wait_for_their_backoff() {
        let (store, clock) = store();
        let id = enqueue(&store, "e-1").await;

        store.mark_failed(id, "broker down").await.unwrap();
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.next_retry_at, Some(clock.now() + Duration::seconds(15)));
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        clock.advance(Duration::seconds(15));
        assert_eq!(store.claim_batch(10).await.unwrap().len(), 1);

        store.mark_failed(id, "broker down").await.unwrap();
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.next_retry_at, Some(clock.now() + Duration::seconds(30)));
    }

    #[tokio::test]
    async fn error_message_is_truncated() {
        let (store, _) = store();
        let id = enqueue(&store, "e-1").await;
        let reason = "z".repeat(10_000);

        store.mark_failed(id, &reason).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.error_message.as_deref(), Some(&reason[..500]));
    }

    #[tokio::test]
    async fn sent_is_terminal_and_idempotent() {
        let (store, clock) = store();
        let id = enqueue(&store, "e-1").await;
        store.mark_failed(id, "timeout").await.unwrap();
        store.mark_failed(id, "timeout").await.unwrap();

        clock.advance(Duration::seconds(30));
        store.mark_sent(id).await.unwrap();
        let sent = store.get(id).await.unwrap().unwrap();
        assert_eq!(sent.status, OutboxStatus::Sent);
        assert_eq!(sent.processed_at, Some(clock.now()));
        assert_eq!(sent.error_message, None);
        assert_eq!(sent.retry_count, 2);

        clock.advance(Duration::seconds(5));
        store.mark_sent(id).await.unwrap();
        store.mark_failed(id, "late failure").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap(), sent);
        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_row_is_not_found() {
        let (store, _) = store();
        let err = store.mark_sent(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OutboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn parked_rows_are_not_claimed() {
        let (store, clock) = store();
        let store = store.with_max_attempts(Some(2));
        let id = enqueue(&store, "e-1").await;

        store.mark_failed(id, "rejected").await.unwrap();
        store.mark_failed(id, "rejected").await.unwrap();
        clock.advance(Duration::hours(1));

        assert!(store.claim_batch(10).await.unwrap().is_empty());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn groups_resume_from_their_committed_offset() {
        let broker = MemoryBroker::new();
        broker.inject("topic", None, b"one");
        broker.inject("topic", None, b"two");

        let mut source = broker.subscribe("group-a", "topic");
        let first = source.fetch().await.unwrap();
        source.commit(&first).await.unwrap();

        let mut resumed = broker.subscribe("group-a", "topic");
        assert_eq!(resumed.fetch().await.unwrap().payload.as_deref(), Some(&b"two"[..]));

        let mut fresh = broker.subscribe("group-b", "topic");
        assert_eq!(fresh.fetch().await.unwrap().offset, 0);
        assert_eq!(broker.lag("group-a", "topic"), 1);
    }

    #[tokio::test]
    async fn rewind_redelivers() {
        let broker = MemoryBroker::new();
        broker.inject("topic", None, b"one");

        let mut source = broker.subscribe("group", "topic");
        let message = source.fetch().await.unwrap();
        source.rewind(&message).await.unwrap();

        assert_eq!(source.fetch().await.unwrap(), message);
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_sends() {
        let broker = MemoryBroker::new();
        let message = OutboundMessage {
            topic: "topic".to_string(),
            key: "k".to_string(),
            payload: b"v".to_vec(),
            headers: Vec::new(),
        };

        broker.set_available(false);
        assert!(broker.send(&message).await.is_err());
        broker.set_available(true);
        broker.send(&message).await.unwrap();

        assert_eq!(broker.sent(), vec![message]);
    }
}
