use std::time::Duration;

use bytes::Bytes;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::message::Record;

/// Dead-letter writes through the Kafka producer.
pub(crate) mod kafka;

/// Header carrying the topic the record was read from.
pub(crate) const ORIGINAL_TOPIC_HEADER: &str = "original-topic";
/// Header carrying the human-readable failure description.
pub(crate) const EXCEPTION_MESSAGE_HEADER: &str = "exception-message";

const UNKNOWN_FAILURE_REASON: &str = "unknown failure";

/// A failed record on its way to the dead-letter topic. The provenance travels in headers, the
/// payload is the original one.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeadLetterEnvelope {
    pub(crate) payload: Bytes,
    pub(crate) partition_key: Option<String>,
    pub(crate) original_topic: String,
    pub(crate) failure_reason: String,
}

impl DeadLetterEnvelope {
    pub(crate) fn new(record: &Record, original_topic: &str, failure_reason: &str) -> Self {
        let failure_reason = if failure_reason.trim().is_empty() {
            UNKNOWN_FAILURE_REASON
        } else {
            failure_reason
        };
        Self {
            payload: record.payload.clone(),
            partition_key: record.partition_key.clone(),
            original_topic: original_topic.to_string(),
            failure_reason: failure_reason.to_string(),
        }
    }

    pub(crate) fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                ORIGINAL_TOPIC_HEADER.to_string(),
                self.original_topic.clone(),
            ),
            (
                EXCEPTION_MESSAGE_HEADER.to_string(),
                self.failure_reason.clone(),
            ),
        ]
    }
}

/// Destination of the records that can not be stored.
#[trait_variant::make(DeadLetterSink: Send)]
#[allow(dead_code)]
pub(crate) trait LocalDeadLetterSink {
    /// Publishes the envelope and returns once the destination confirmed it.
    async fn publish(&self, envelope: DeadLetterEnvelope, timeout: Duration) -> Result<()>;
}

/// Forwards failed records to the dead-letter topic and reports whether the write is durable.
pub(crate) struct DeadLetterForwarder<D> {
    sink: D,
    topic: String,
    timeout: Duration,
}

impl<D> DeadLetterForwarder<D>
where
    D: DeadLetterSink,
{
    pub(crate) fn new(sink: D, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            sink,
            topic: topic.into(),
            timeout,
        }
    }

    /// Publishes the record with its provenance and blocks until the broker confirmed the write,
    /// at most for the configured timeout. `Ok` means the failure is durably recorded.
    pub(crate) async fn forward(
        &self,
        record: &Record,
        original_topic: &str,
        failure_reason: &str,
    ) -> Result<()> {
        let envelope = DeadLetterEnvelope::new(record, original_topic, failure_reason);
        warn!(
            key = ?record.partition_key,
            dead_letter_topic = %self.topic,
            reason = %envelope.failure_reason,
            "Sending record to dead-letter topic"
        );

        let publish = self.sink.publish(envelope, self.timeout);
        let result = match tokio::time::timeout(self.timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadLetter(format!(
                "publish was not confirmed within {:?}",
                self.timeout
            ))),
        };

        if let Err(e) = &result {
            error!(
                ?e,
                dead_letter_topic = %self.topic,
                "Failed to send record to dead-letter topic"
            );
        }
        result
    }
}
