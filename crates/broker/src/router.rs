//! Event router: consumes command topics, runs handlers, publishes typed
//! replies.
//!
//! Each registration runs `workers` subscriber loops in one consumer
//! group, so partitions spread across workers and every message is
//! processed by exactly one of them per group. A handler gets 15 seconds;
//! panic, timeout, handler error, or a failed reply publish all leave the
//! offset uncommitted and seek back so the broker redelivers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message as KafkaMessage};
use rdkafka::Offset;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::{BrokerError, Message, Publisher};

/// Router-level per-message deadline.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(15);
/// Pause after a failed message so a poison message cannot spin a worker.
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// A message handler. Business failures belong in the returned reply with
/// `success=false`; an `Err` means the message could not be processed and
/// must be redelivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>>;
}

struct Registration {
    name: String,
    topic: String,
    reply_topic: Option<String>,
    publisher: Option<Arc<dyn Publisher>>,
    handler: Arc<dyn MessageHandler>,
}

/// EventRouter wires topics to handlers over one consumer group.
pub struct EventRouter {
    brokers: Vec<String>,
    group_id: String,
    workers: usize,
    registrations: Vec<Arc<Registration>>,
}

impl EventRouter {
    pub fn new(brokers: &[String], group_id: &str, workers: usize) -> Self {
        Self {
            brokers: brokers.to_vec(),
            group_id: group_id.to_string(),
            workers: workers.max(1),
            registrations: Vec::new(),
        }
    }

    /// Registers a handler whose replies go to `reply_topic` via
    /// `publisher`.
    pub fn add_handler(
        &mut self,
        name: &str,
        topic: &str,
        reply_topic: &str,
        publisher: Arc<dyn Publisher>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.registrations.push(Arc::new(Registration {
            name: name.to_string(),
            topic: topic.to_string(),
            reply_topic: Some(reply_topic.to_string()),
            publisher: Some(publisher),
            handler,
        }));
    }

    /// Registers a handler that publishes nothing on its own behalf (the
    /// orchestrator publishes through its own service dependencies).
    pub fn add_no_publisher_handler(
        &mut self,
        name: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.registrations.push(Arc::new(Registration {
            name: name.to_string(),
            topic: topic.to_string(),
            reply_topic: None,
            publisher: None,
            handler,
        }));
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.len()
    }

    fn create_consumer(&self) -> Result<StreamConsumer, KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()
    }

    /// Runs all subscriber loops until the given shutdown signal fires.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), BrokerError> {
        let mut handles = Vec::new();
        for registration in &self.registrations {
            for worker in 0..self.workers {
                let consumer = self.create_consumer()?;
                consumer.subscribe(&[registration.topic.as_str()])?;
                let registration = Arc::clone(registration);
                let shutdown = Arc::clone(&shutdown);
                handles.push(tokio::spawn(async move {
                    worker_loop(consumer, registration, shutdown, worker).await;
                }));
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("router worker terminated abnormally: {e}");
            }
        }
        Ok(())
    }
}

async fn worker_loop(
    consumer: StreamConsumer,
    registration: Arc<Registration>,
    shutdown: Arc<Notify>,
    worker: usize,
) {
    info!(
        handler = %registration.name,
        topic = %registration.topic,
        worker,
        "subscriber loop started"
    );
    let mut stream = consumer.stream();
    loop {
        tokio::select! {
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(msg)) => process(&consumer, &registration, &msg).await,
                    Some(Err(e)) => error!(handler = %registration.name, "Kafka error: {e}"),
                    None => {
                        debug!(handler = %registration.name, "Kafka stream ended");
                        break;
                    }
                }
            }
            _ = shutdown.notified() => {
                info!(handler = %registration.name, worker, "subscriber received shutdown signal");
                break;
            }
        }
    }
}

async fn process(
    consumer: &StreamConsumer,
    registration: &Arc<Registration>,
    kafka_msg: &BorrowedMessage<'_>,
) {
    let msg = from_kafka(kafka_msg);
    let handler = Arc::clone(&registration.handler);
    let handler_msg = msg.clone();

    // The spawn isolates a panicking handler from the subscriber loop and
    // turns the panic into a redelivery.
    let outcome = tokio::spawn(async move {
        tokio::time::timeout(HANDLER_TIMEOUT, handler.handle(&handler_msg)).await
    })
    .await;

    let replies = match outcome {
        Err(join_err) => Err(format!("handler panicked: {join_err}")),
        Ok(Err(_elapsed)) => Err(format!(
            "handler exceeded {}s deadline",
            HANDLER_TIMEOUT.as_secs()
        )),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Ok(Ok(replies))) => Ok(replies),
    };

    match replies {
        Ok(replies) => {
            if let (Some(reply_topic), Some(publisher)) =
                (&registration.reply_topic, &registration.publisher)
            {
                for mut reply in replies {
                    // The correlation id travels verbatim across the whole saga.
                    if reply.correlation_id().is_none() {
                        if let Some(correlation_id) = msg.correlation_id() {
                            reply.set_correlation_id(correlation_id);
                        }
                    }
                    if let Err(e) = publisher.publish(reply_topic, reply).await {
                        error!(
                            handler = %registration.name,
                            "reply publish failed, message will be redelivered: {e}"
                        );
                        nack(consumer, kafka_msg).await;
                        return;
                    }
                }
            }
            if let Err(e) = consumer.commit_message(kafka_msg, CommitMode::Async) {
                error!(handler = %registration.name, "offset commit failed: {e}");
            }
        }
        Err(reason) => {
            error!(
                handler = %registration.name,
                reason,
                "message failed, seeking back for redelivery"
            );
            nack(consumer, kafka_msg).await;
        }
    }
}

async fn nack(consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.seek(
        msg.topic(),
        msg.partition(),
        Offset::Offset(msg.offset()),
        SEEK_TIMEOUT,
    ) {
        error!("seek for redelivery failed: {e}");
    }
    tokio::time::sleep(REDELIVERY_BACKOFF).await;
}

fn from_kafka(kafka_msg: &BorrowedMessage<'_>) -> Message {
    let mut msg = Message::new(kafka_msg.payload().unwrap_or_default().to_vec());
    if let Some(headers) = kafka_msg.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                if let Ok(value) = std::str::from_utf8(value) {
                    if header.key == "message_uuid" {
                        msg.uuid = value.to_string();
                    } else {
                        msg.set(header.key, value);
                    }
                }
            }
        }
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _msg: &Message) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_registration_bookkeeping() {
        let brokers = vec!["localhost:9092".to_string()];
        let mut router = EventRouter::new(&brokers, "test_group", 0);
        // Zero workers would consume nothing; the router floors at one.
        assert_eq!(router.workers, 1);
        router.add_no_publisher_handler("h1", "topic.a", Arc::new(NoopHandler));
        assert_eq!(router.handler_count(), 1);
    }
}
