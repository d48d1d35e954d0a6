//! Cross-service event pipeline for the HRIS services: a transactional
//! outbox, the worker that drains it into Kafka, and the idempotent
//! consumer loop on the other side.

pub mod broker;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod events;
pub mod kafka;
pub mod memory;
pub mod models;
pub mod outbox;
pub mod publisher;
pub mod schema;
pub mod telemetry;

pub use broker::{BrokerWriter, InboundMessage, MessageSource, OutboundMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsumerConfig, KafkaConfig, PublisherConfig};
pub use consumer::{EventConsumer, EventHandler, Outcome};
pub use db::{ClaimMode, DbPool, PgOutboxStore};
pub use error::{BrokerError, ConfigError, DomainError, OutboxError};
pub use events::{DomainEvent, EmployeeCreated, PayrollPayslipRequested};
pub use outbox::{
    publish_event, publish_in_tx, NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore,
    OutboxWriter,
};
pub use publisher::{OutboxPublisher, TickReport};
