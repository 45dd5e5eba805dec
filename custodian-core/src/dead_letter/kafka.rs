use std::time::Duration;

use custodian_kafka::sink::{KafkaSink, KafkaSinkMessage};

use crate::dead_letter::{DeadLetterEnvelope, DeadLetterSink};
use crate::error::{Error, Result};

impl From<DeadLetterEnvelope> for KafkaSinkMessage {
    fn from(envelope: DeadLetterEnvelope) -> Self {
        let headers = envelope.headers();
        Self {
            partition_key: envelope.partition_key,
            headers,
            payload: envelope.payload,
        }
    }
}

impl DeadLetterSink for KafkaSink {
    async fn publish(&self, envelope: DeadLetterEnvelope, timeout: Duration) -> Result<()> {
        self.send(envelope.into(), timeout)
            .await
            .map_err(|e| Error::DeadLetter(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_envelope_to_kafka_message() {
        let envelope = DeadLetterEnvelope {
            payload: Bytes::from(r#"{"id":"456"}"#),
            partition_key: Some("456".to_string()),
            original_topic: "input-topic".to_string(),
            failure_reason: "duplicate key".to_string(),
        };
        let message: KafkaSinkMessage = envelope.into();
        assert_eq!(message.payload, Bytes::from(r#"{"id":"456"}"#));
        assert_eq!(message.partition_key.as_deref(), Some("456"));
        assert_eq!(
            message.headers,
            vec![
                ("original-topic".to_string(), "input-topic".to_string()),
                ("exception-message".to_string(), "duplicate key".to_string()),
            ]
        );
    }
}
