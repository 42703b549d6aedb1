//! Event producer for the content service side of the pipeline
//!
//! One typed event per user action is serialized to the inbound wire schema
//! and written to the topic for its kind. Delivery failures are logged and
//! returned to the caller; nothing is retried here.

use super::broker::{LogError, RecordPosition, SqliteEventLog};
use super::types::{Event, EventKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Message addressed to a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub value: Vec<u8>,
}

#[derive(Debug)]
pub enum ProducerError {
    Serialization(serde_json::Error),
    Delivery(LogError),
}

impl From<serde_json::Error> for ProducerError {
    fn from(err: serde_json::Error) -> Self {
        ProducerError::Serialization(err)
    }
}

impl From<LogError> for ProducerError {
    fn from(err: LogError) -> Self {
        ProducerError::Delivery(err)
    }
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ProducerError::Delivery(e) => write!(f, "Delivery error: {}", e),
        }
    }
}

impl std::error::Error for ProducerError {}

/// Write side of the durable log
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append messages in order, returning where each one landed
    async fn write_messages(&self, messages: Vec<LogMessage>) -> Result<Vec<RecordPosition>, LogError>;
}

/// Appends run on the blocking pool; the log serializes writers on its own lock
#[async_trait]
impl EventSink for Arc<SqliteEventLog> {
    async fn write_messages(&self, messages: Vec<LogMessage>) -> Result<Vec<RecordPosition>, LogError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            messages
                .iter()
                .map(|message| log.append(&message.topic, &message.value))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| LogError::Task(e.to_string()))?
    }
}

/// Sink decorator that logs every delivery attempt
pub struct LoggedSink<S> {
    inner: S,
}

impl<S> LoggedSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: EventSink> EventSink for LoggedSink<S> {
    async fn write_messages(&self, messages: Vec<LogMessage>) -> Result<Vec<RecordPosition>, LogError> {
        log::debug!("📤 Preparing to send {} event(s)", messages.len());

        match self.inner.write_messages(messages).await {
            Ok(positions) => {
                for pos in &positions {
                    log::debug!("✅ Event sent (partition {}, offset {})", pos.partition, pos.offset);
                }
                Ok(positions)
            }
            Err(e) => {
                log::error!("❌ Error sending event: {}", e);
                Err(e)
            }
        }
    }
}

/// Producer emitting engagement events to their kind's topic
pub struct EventProducer<S> {
    sink: S,
}

impl<S: EventSink> EventProducer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Serialize and deliver one event, blocking on the log's acknowledgment
    pub async fn send_event(&self, kind: EventKind, event: &Event) -> Result<RecordPosition, ProducerError> {
        let value = serde_json::to_vec(event)?;
        let message = LogMessage {
            topic: kind.topic().to_string(),
            value,
        };

        let positions = self.sink.write_messages(vec![message]).await.map_err(|e| {
            log::error!("❌ Failed to send {} event for post {}: {}", kind, event.post_id, e);
            ProducerError::Delivery(e)
        })?;

        positions
            .into_iter()
            .next()
            .ok_or_else(|| ProducerError::Delivery(LogError::UnknownTopic(kind.topic().to_string())))
    }
}
