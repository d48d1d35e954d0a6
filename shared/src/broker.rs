use async_trait::async_trait;

use crate::error::BrokerError;
use crate::events::{HEADER_AGGREGATE_TYPE, HEADER_EVENT_TYPE};
use crate::outbox::OutboxEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl From<&OutboxEvent> for OutboundMessage {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            topic: event.topic.clone(),
            key: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            headers: vec![
                (HEADER_EVENT_TYPE.to_string(), event.event_type.clone()),
                (HEADER_AGGREGATE_TYPE.to_string(), event.aggregate_type.clone()),
            ],
        }
    }
}

/// A fetched message, detached from the client that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }
}

#[async_trait]
pub trait BrokerWriter: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
}

/// A single consumer-group subscription.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next message.
    async fn fetch(&mut self) -> Result<InboundMessage, BrokerError>;

    /// Records `message` as processed for the group.
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Makes the next fetch return `message` again.
    async fn rewind(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;
}
