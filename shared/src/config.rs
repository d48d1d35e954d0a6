//! Runtime settings for the broker clients, the publisher and the consumers.
//!
//! Binaries fill these from their `clap` arguments; every constructor here
//! validates what a process cannot start without.

use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(3);
pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BATCH_SIZE: i64 = 50;
pub const DEFAULT_CONSUMER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    pub client_id: String,
    /// Transport-level publish timeout; expiry is a publish failure.
    pub message_timeout: Duration,
    pub session_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, client_id: impl Into<String>) -> Result<Self, ConfigError> {
        let brokers = brokers.into();
        if brokers.split(',').all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Missing("KAFKA_BROKERS"));
        }

        Ok(Self {
            brokers,
            client_id: client_id.into(),
            message_timeout: Duration::from_millis(5000),
            session_timeout: Duration::from_millis(6000),
        })
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PUBLISH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PublisherConfig {
    /// Intervals below the minimum are raised to it.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_PUBLISH_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                minimum_ms = MIN_PUBLISH_INTERVAL.as_millis() as u64,
                "Publish interval below minimum, clamping"
            );
            self.interval = MIN_PUBLISH_INTERVAL;
        } else {
            self.interval = interval;
        }
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Result<Self, ConfigError> {
        if batch_size <= 0 {
            return Err(ConfigError::Invalid {
                var: "OUTBOX_BATCH_SIZE",
                reason: format!("must be positive, got {batch_size}"),
            });
        }
        self.batch_size = batch_size;
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topic: String,
    /// Pause before re-fetching a message whose effect failed.
    pub retry_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Result<Self, ConfigError> {
        let group_id = group_id.into();
        if group_id.trim().is_empty() {
            return Err(ConfigError::Missing("consumer group"));
        }
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(ConfigError::Missing("consumer topic"));
        }

        Ok(Self {
            group_id,
            topic,
            retry_delay: DEFAULT_CONSUMER_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_broker_list_is_fatal() {
        assert!(matches!(
            KafkaConfig::new("", "outbox-worker"),
            Err(ConfigError::Missing("KAFKA_BROKERS"))
        ));
        assert!(KafkaConfig::new(" , ", "outbox-worker").is_err());

        let config = KafkaConfig::new("kafka-1:9092,kafka-2:9092", "outbox-worker").unwrap();
        assert_eq!(config.message_timeout, Duration::from_secs(5));
    }

    #[test]
    fn publish_interval_has_a_floor() {
        let config = PublisherConfig::default().with_interval(Duration::from_millis(10));
        assert_eq!(config.interval, MIN_PUBLISH_INTERVAL);

        let config = PublisherConfig::default().with_interval(Duration::from_secs(7));
        assert_eq!(config.interval, Duration::from_secs(7));

        assert_eq!(PublisherConfig::default().interval, Duration::from_secs(3));
        assert_eq!(PublisherConfig::default().batch_size, 50);
    }

    #[test]
    fn batch_size_must_be_positive() {
        assert!(PublisherConfig::default().with_batch_size(0).is_err());
        assert_eq!(PublisherConfig::default().with_batch_size(10).unwrap().batch_size, 10);
    }

    #[test]
    fn consumer_requires_group_and_topic() {
        assert!(ConsumerConfig::new("", "hr.employee.lifecycle.v1").is_err());
        assert!(ConsumerConfig::new("go-hris-employee-salary", "").is_err());

        let config =
            ConsumerConfig::new("go-hris-employee-salary", "hr.employee.lifecycle.v1").unwrap();
        assert_eq!(config.retry_delay, DEFAULT_CONSUMER_RETRY_DELAY);
    }
}
