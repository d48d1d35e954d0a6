//! Transactional outbox: event rows staged inside business transactions and
//! drained to the broker by the publisher worker.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::OutboxError;
use crate::events::DomainEvent;

pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;
pub const BACKOFF_STEP_SECS: i64 = 15;
pub const MAX_BACKOFF_STEPS: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::InvalidEvent(format!("unknown status {other:?}"))),
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub request_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Whether the publisher may pick this row up at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status != OutboxStatus::Sent && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// An event about to be appended inside a business transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub request_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
}

impl NewOutboxEvent {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.id.is_nil() {
            return Err(OutboxError::InvalidEvent("id is empty".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(OutboxError::InvalidEvent("topic is empty".to_string()));
        }
        if self.payload.is_empty() {
            return Err(OutboxError::InvalidEvent("payload is empty".to_string()));
        }
        Ok(())
    }

    pub(crate) fn into_row(self, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            request_id: self.request_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            topic: self.topic,
            payload: self.payload,
            status: self.status,
            retry_count: 0,
            next_retry_at: None,
            processed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Delay before the next attempt after `retry_count` failures.
pub fn retry_backoff(retry_count: i32) -> Duration {
    Duration::seconds(BACKOFF_STEP_SECS * i64::from(retry_count.clamp(0, MAX_BACKOFF_STEPS)))
}

pub fn truncate_error(reason: &str) -> String {
    reason.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Appends outbox rows as part of an open business transaction.
///
/// Nothing written through a writer is visible until the enclosing
/// transaction commits.
#[async_trait]
pub trait OutboxWriter: Send {
    async fn enlist(&mut self, event: NewOutboxEvent) -> Result<(), OutboxError>;
}

/// Publisher-side view of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` claimable rows, oldest first.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn mark_sent(&self, id: Uuid) -> Result<(), OutboxError>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), OutboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError>;
}

pub async fn enlist<W>(tx: &mut W, event: NewOutboxEvent) -> Result<(), OutboxError>
where
    W: OutboxWriter + ?Sized,
{
    tx.enlist(event).await
}

/// Validates, assigns a fresh id and appends a pending event.
pub async fn publish_in_tx<W>(
    tx: &mut W,
    topic: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: Vec<u8>,
    request_id: Option<String>,
) -> Result<Uuid, OutboxError>
where
    W: OutboxWriter + ?Sized,
{
    let event = NewOutboxEvent {
        id: Uuid::new_v4(),
        request_id,
        aggregate_type: aggregate_type.to_string(),
        aggregate_id: aggregate_id.to_string(),
        event_type: event_type.to_string(),
        topic: topic.to_string(),
        payload,
        status: OutboxStatus::Pending,
    };
    event.validate()?;

    let id = event.id;
    tx.enlist(event).await?;
    Ok(id)
}

pub async fn publish_event<W, E>(tx: &mut W, event: &E) -> Result<Uuid, OutboxError>
where
    W: OutboxWriter + ?Sized,
    E: DomainEvent,
{
    let payload = event.encode()?;
    publish_in_tx(
        tx,
        E::TOPIC,
        E::AGGREGATE_TYPE,
        &event.aggregate_id(),
        event.event_type(),
        payload,
        event.request_id().map(str::to_string),
    )
    .await
}
