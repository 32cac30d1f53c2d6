//! Messaging infrastructure for the purchase saga.
//!
//! Transaction commands and replies travel over Kafka (consumer groups
//! give queue-group, at-least-once delivery); progress events go to a
//! Redis stream with bounded retention. Both publishers speak the same
//! [`Publisher`] trait, and the [`router::EventRouter`] drives message
//! handlers with a per-message timeout and redelivery on failure.

pub mod publisher;
pub mod router;
pub mod trace;

pub use publisher::{KafkaPublisher, Publisher, RedisStreamPublisher};
pub use router::{EventRouter, MessageHandler};
pub use trace::TraceParent;

use std::collections::HashMap;

use model::topic;
use thiserror::Error;
use uuid::Uuid;

/// Broker-layer error.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Transport-neutral message: payload bytes plus string metadata.
///
/// Metadata carries the correlation id, the reply handler tag, and the
/// traceparent; every publisher maps it onto its transport's headers.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message id, generated at construction.
    pub uuid: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.metadata.insert(key.into(), val.into());
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(topic::CORRELATION_ID_KEY)
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.set(topic::CORRELATION_ID_KEY, id);
    }

    pub fn handler_tag(&self) -> Option<&str> {
        self.get(topic::HANDLER_KEY)
    }

    pub fn set_handler_tag(&mut self, tag: impl Into<String>) {
        self.set(topic::HANDLER_KEY, tag);
    }

    pub fn traceparent(&self) -> Option<TraceParent> {
        self.get(topic::SPAN_CONTEXT_KEY)
            .and_then(|raw| TraceParent::parse(raw).ok())
    }

    pub fn set_traceparent(&mut self, traceparent: &TraceParent) {
        self.set(topic::SPAN_CONTEXT_KEY, traceparent.to_string());
    }
}
