//! Publishers for the two outbound paths.
//!
//! Step and rollback commands go to the Kafka transaction broker; progress
//! events go to a Redis stream with approximate MAXLEN retention. They are
//! separate because retention, ordering, and consumer-count semantics
//! differ.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::{BrokerError, Message};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-neutral publisher seam; owned by the server structs, torn
/// down with them.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, msg: Message) -> Result<(), BrokerError>;
}

/// Kafka publisher for transaction commands and replies.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(brokers: &[String]) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, msg: Message) -> Result<(), BrokerError> {
        let mut headers = OwnedHeaders::new().insert(Header {
            key: "message_uuid",
            value: Some(&msg.uuid),
        });
        for (key, value) in &msg.metadata {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value),
            });
        }
        // Keying by correlation id keeps one saga's messages on one
        // partition, i.e. in order.
        let key = msg.correlation_id().unwrap_or(&msg.uuid).to_string();
        let record = FutureRecord::to(topic)
            .key(&key)
            .payload(&msg.payload)
            .headers(headers);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(kafka_err, _owned_msg)| BrokerError::Publish {
                topic: topic.to_string(),
                reason: kafka_err.to_string(),
            })?;
        debug!(topic, uuid = %msg.uuid, "message published");
        Ok(())
    }
}

/// Redis stream publisher for the durable result stream.
pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    maxlens: HashMap<String, i64>,
}

impl RedisStreamPublisher {
    pub fn new(conn: ConnectionManager, maxlens: HashMap<String, i64>) -> Self {
        Self { conn, maxlens }
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, msg: Message) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic);
        if let Some(maxlen) = self.maxlens.get(topic) {
            cmd.arg("MAXLEN").arg("~").arg(*maxlen);
        }
        cmd.arg("*");
        cmd.arg("message_uuid").arg(&msg.uuid);
        cmd.arg("payload").arg(&msg.payload);
        for (key, value) in &msg.metadata {
            cmd.arg(key).arg(value);
        }
        let entry_id: String = cmd.query_async(&mut conn).await?;
        debug!(topic, entry_id, "result event appended");
        Ok(())
    }
}
