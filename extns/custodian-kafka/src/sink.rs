use std::time::Duration;

use bytes::Bytes;
use rdkafka::{
    ClientConfig,
    config::RDKafkaLogLevel,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// The authentication mechanism to use for the Kafka producer.
    pub auth: Option<KafkaSaslAuth>,
    /// The TLS configuration for the Kafka producer.
    pub tls: Option<TlsConfig>,
    /// How long librdkafka keeps trying to deliver a message before reporting a failure.
    pub delivery_timeout: Duration,
}

/// Produces to a single topic and waits for the broker acknowledgement of every message.
#[derive(Clone)]
pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkMessage {
    pub partition_key: Option<String>,
    /// Headers in the order they are attached to the record.
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
}

pub fn new_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set(
            "message.timeout.ms",
            config.delivery_timeout.as_millis().to_string(),
        )
        // a delivery report means every in-sync replica has the record
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("client.id", "custodian-dead-letter")
        .set_log_level(RDKafkaLogLevel::Warning);

    crate::update_auth_config(&mut client_config, config.tls, config.auth);

    let producer: FutureProducer = client_config
        .create()
        .map_err(|e| Error::Kafka(format!("Failed to create producer: {e}")))?;

    Ok(KafkaSink {
        producer,
        topic: config.topic,
    })
}

impl KafkaSink {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes one message and waits at most `timeout` for the broker to confirm it.
    pub async fn send(&self, message: KafkaSinkMessage, timeout: Duration) -> Result<()> {
        let KafkaSinkMessage {
            partition_key,
            headers: inp_headers,
            payload,
        } = message;

        let mut headers = OwnedHeaders::new_with_capacity(inp_headers.len());
        for (key, value) in &inp_headers {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }
        let mut record: FutureRecord<'_, String, _> = FutureRecord::to(&self.topic)
            .headers(headers)
            .payload(payload.as_ref());
        if let Some(ref partition_key) = partition_key {
            record = record.key(partition_key);
        }

        let delivery = self.producer.send(record, Timeout::After(timeout));
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => {
                tracing::error!(?e, topic = %self.topic, "Sending payload to Kafka topic");
                Err(Error::Kafka(format!("Sending payload to kafka: {e:?}")))
            }
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_sink_with_default_config() {
        let sink = new_sink(KafkaSinkConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: "dead-letter".to_string(),
            auth: None,
            tls: None,
            delivery_timeout: Duration::from_secs(5),
        })
        .expect("Producer creation does not connect");
        assert_eq!(sink.topic(), "dead-letter");
    }

    #[tokio::test]
    async fn test_send_times_out_without_broker() {
        // nothing listens on this port, so the delivery never gets confirmed
        let sink = new_sink(KafkaSinkConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            topic: "dead-letter".to_string(),
            auth: None,
            tls: None,
            delivery_timeout: Duration::from_secs(30),
        })
        .unwrap();
        let result = sink
            .send(
                KafkaSinkMessage {
                    partition_key: None,
                    headers: vec![],
                    payload: Bytes::from("payload"),
                },
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn test_kafka_sink_send_with_headers() {
        use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
        use rdkafka::consumer::{Consumer, StreamConsumer};
        use rdkafka::message::{Headers, Message};

        let topic_name = format!(
            "custodian_sink_test_{}",
            uuid::Uuid::new_v4().to_string().replace('-', "")
        );
        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create::<AdminClient<_>>()
            .expect("Failed to create admin client");
        admin_client
            .create_topics(
                &[NewTopic::new(&topic_name, 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .expect("Failed to create topic");

        let sink = new_sink(KafkaSinkConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic_name.clone(),
            auth: None,
            tls: None,
            delivery_timeout: Duration::from_secs(5),
        })
        .expect("Failed to create KafkaSink");
        sink.send(
            KafkaSinkMessage {
                partition_key: Some("key1".to_string()),
                headers: vec![
                    ("original-topic".to_string(), "input-topic".to_string()),
                    ("exception-message".to_string(), "boom".to_string()),
                ],
                payload: Bytes::from("test-payload"),
            },
            Duration::from_secs(5),
        )
        .await
        .expect("Failed to send message");

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", format!("test-consumer-{}", uuid::Uuid::new_v4()))
            .set("auto.offset.reset", "earliest")
            .create()
            .expect("Failed to create consumer");
        consumer
            .subscribe(&[&topic_name])
            .expect("Failed to subscribe");
        let msg = tokio::time::timeout(Duration::from_secs(10), consumer.recv())
            .await
            .expect("Did not receive message from Kafka")
            .expect("Kafka error");
        assert_eq!(msg.payload().unwrap(), b"test-payload");
        assert_eq!(msg.key().unwrap(), b"key1");
        let headers: Vec<(String, String)> = msg
            .headers()
            .unwrap()
            .iter()
            .map(|h| {
                (
                    h.key.to_string(),
                    String::from_utf8_lossy(h.value.unwrap()).to_string(),
                )
            })
            .collect();
        assert_eq!(
            headers,
            vec![
                ("original-topic".to_string(), "input-topic".to_string()),
                ("exception-message".to_string(), "boom".to_string()),
            ]
        );
    }
}
