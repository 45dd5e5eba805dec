use std::time::Duration;

use custodian_kafka::{KafkaMessage, KafkaOffset, KafkaSource};

use crate::ack::Acknowledger;
use crate::error::Error;
use crate::message::{Offset, Record};
use crate::source::RecordSource;

impl From<KafkaMessage> for Record {
    fn from(message: KafkaMessage) -> Self {
        Record {
            offset: Offset {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
            },
            payload: message.value,
            partition_key: message.key,
            source_topic: message.topic,
            received_timestamp: message.timestamp.unwrap_or_default(),
        }
    }
}

impl From<&Offset> for KafkaOffset {
    fn from(offset: &Offset) -> Self {
        KafkaOffset {
            topic: offset.topic.clone(),
            partition: offset.partition,
            offset: offset.offset,
        }
    }
}

impl From<custodian_kafka::Error> for Error {
    fn from(value: custodian_kafka::Error) -> Self {
        match value {
            custodian_kafka::Error::Kafka(e) => Error::Source(e),
            custodian_kafka::Error::Connection { server, error } => Error::Source(format!(
                "Failed to connect to Kafka server: {server} - {error}"
            )),
            custodian_kafka::Error::Timeout(after) => {
                Error::Source(format!("Kafka call timed out after {after:?}"))
            }
            custodian_kafka::Error::ActorTerminated => {
                Error::ActorPatternRecv("Kafka actor task terminated".to_string())
            }
            custodian_kafka::Error::Other(e) => Error::Source(e),
        }
    }
}

pub(crate) async fn new_kafka_source(
    cfg: custodian_kafka::KafkaSourceConfig,
    read_timeout: Duration,
) -> crate::Result<KafkaSource> {
    Ok(KafkaSource::connect(cfg, read_timeout).await?)
}

impl RecordSource for KafkaSource {
    fn name(&self) -> &'static str {
        "Kafka"
    }

    async fn read(&mut self) -> crate::Result<Option<Record>> {
        Ok(self.read_message().await?.map(Record::from))
    }

    async fn pending(&self) -> crate::Result<Option<usize>> {
        Ok(self.pending_messages().await?)
    }
}

impl Acknowledger for KafkaSource {
    async fn commit(&self, offset: &Offset) -> crate::Result<()> {
        KafkaSource::commit(self, offset.into())
            .await
            .map_err(|e| Error::Ack(format!("commit of {offset} failed: {e}")))
    }

    async fn redeliver_after(&self, offset: &Offset, delay: Duration) -> crate::Result<()> {
        KafkaSource::redeliver_after(self, offset.into(), delay)
            .await
            .map_err(|e| Error::Ack(format!("redelivery of {offset} failed: {e}")))
    }
}
