//! rdkafka-backed broker writer and consumer source.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{BrokerWriter, InboundMessage, MessageSource, OutboundMessage};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::BrokerError;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaWriter {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaWriter {
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .set("acks", "all")
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        info!(brokers = %config.brokers, client_id = %config.client_id, "Kafka producer created");

        Ok(Self {
            producer,
            message_timeout: config.message_timeout,
        })
    }
}

#[async_trait]
impl BrokerWriter for KafkaWriter {
    async fn send(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(e, _)| BrokerError::Publish {
                topic: message.topic.clone(),
                cause: e.to_string(),
            })?;

        debug!(topic = %message.topic, key = %message.key, partition, offset, "Message delivered");
        Ok(())
    }
}

/// Commit and seek are blocking librdkafka calls run under
/// [`tokio::task::block_in_place`], so the source must be driven from the
/// multi-threaded runtime.
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Subscribes a manually-committing consumer that starts from the
    /// earliest offset when the group has none.
    pub fn subscribe(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Result<Self, BrokerError> {
        let stream: StreamConsumer = ClientConfig::new()
            .set("group.id", &consumer.group_id)
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", &kafka.client_id)
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                kafka.session_timeout.as_millis().to_string(),
            )
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        stream
            .subscribe(&[consumer.topic.as_str()])
            .map_err(|e| BrokerError::Fetch {
                topic: consumer.topic.clone(),
                cause: e.to_string(),
            })?;

        info!(group = %consumer.group_id, topic = %consumer.topic, "Kafka consumer subscribed");

        Ok(Self {
            consumer: stream,
            topic: consumer.topic.clone(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&mut self) -> Result<InboundMessage, BrokerError> {
        let message = self.consumer.recv().await.map_err(|e| BrokerError::Fetch {
            topic: self.topic.clone(),
            cause: e.to_string(),
        })?;

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
        })
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        let commit_error = |cause: String| BrokerError::Commit {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            cause,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| commit_error(e.to_string()))?;

        let consumer = &self.consumer;
        tokio::task::block_in_place(|| consumer.commit(&tpl, CommitMode::Sync))
            .map_err(|e| commit_error(e.to_string()))
    }

    async fn rewind(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        let consumer = &self.consumer;
        tokio::task::block_in_place(|| {
            consumer.seek(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset),
                SEEK_TIMEOUT,
            )
        })
        .map_err(|e| BrokerError::Seek {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                cause: e.to_string(),
            })
    }
}
