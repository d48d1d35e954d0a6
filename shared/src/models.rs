use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::error::OutboxError;
use crate::outbox::{NewOutboxEvent, OutboxEvent};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::outbox_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub request_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewDbOutboxEvent {
    pub id: Uuid,
    pub request_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: String,
}

impl From<NewOutboxEvent> for NewDbOutboxEvent {
    fn from(event: NewOutboxEvent) -> Self {
        Self {
            id: event.id,
            request_id: event.request_id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            topic: event.topic,
            payload: event.payload,
            status: event.status.as_str().to_string(),
        }
    }
}

impl TryFrom<DbOutboxEvent> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: DbOutboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            request_id: row.request_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            topic: row.topic,
            payload: row.payload,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            processed_at: row.processed_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
