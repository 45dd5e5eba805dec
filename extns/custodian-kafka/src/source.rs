use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

/// Upper bound for the blocking librdkafka calls (metadata, seek, commit).
const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The Kafka topic to consume records from.
    pub topic: String,
    /// The consumer group to use for the Kafka consumer.
    pub consumer_group: String,
    /// The authentication mechanism to use for the Kafka consumer.
    pub auth: Option<KafkaSaslAuth>,
    /// The TLS configuration for the Kafka consumer.
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

/// A single record received from Kafka.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// The topic name.
    pub topic: String,
    /// The user payload.
    pub value: Bytes,
    /// Key of the message
    pub key: Option<String>,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message.
    pub offset: i64,
    /// The headers of the message.
    pub headers: HashMap<String, String>,
    /// The timestamp of the message in milliseconds since epoch.
    /// None if timestamp is not available.
    pub timestamp: Option<i64>,
}

impl KafkaMessage {
    fn from_message<M: Message>(message: &M) -> Self {
        let headers = match message.headers() {
            Some(headers) => headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
                    )
                })
                .collect(),
            None => HashMap::new(),
        };

        let value = match message.payload() {
            Some(payload) => Bytes::copy_from_slice(payload),
            // The rdkafka doc says that the payload can be None if there is no payload.
            None => Bytes::new(),
        };

        KafkaMessage {
            topic: message.topic().to_string(),
            value,
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).to_string()),
            partition: message.partition(),
            offset: message.offset(),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    /// Position of this message, used to commit or rewind it.
    pub fn offset(&self) -> KafkaOffset {
        KafkaOffset {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committed offsets: {:?}", result);
    }
}

/// Represents a Kafka offset for a specific topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    /// The topic name
    pub topic: String,
    /// The partition id within a topic
    pub partition: i32,
    /// The offset of the message within a partition
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PausedPartition {
    rewind_to: i64,
    resume_at: Instant,
    delay: Duration,
}

/// Partitions waiting for a delayed redelivery. A paused partition delivers nothing until it
/// has been rewound to `rewind_to` and resumed.
#[derive(Debug, Default)]
struct PausedPartitions {
    partitions: HashMap<i32, PausedPartition>,
}

impl PausedPartitions {
    fn pause(&mut self, partition: i32, rewind_to: i64, delay: Duration, now: Instant) {
        let resume_at = now + delay;
        self.partitions
            .entry(partition)
            .and_modify(|paused| {
                // the lowest offset wins, otherwise a record could be skipped
                paused.rewind_to = paused.rewind_to.min(rewind_to);
                paused.resume_at = paused.resume_at.max(resume_at);
                paused.delay = delay;
            })
            .or_insert(PausedPartition {
                rewind_to,
                resume_at,
                delay,
            });
    }

    fn is_paused(&self, partition: i32) -> bool {
        self.partitions.contains_key(&partition)
    }

    fn next_resume_at(&self) -> Option<Instant> {
        self.partitions.values().map(|p| p.resume_at).min()
    }

    /// Removes and returns the partitions whose delay has elapsed, ordered by partition id.
    fn take_due(&mut self, now: Instant) -> Vec<(i32, PausedPartition)> {
        let mut due: Vec<(i32, PausedPartition)> = self
            .partitions
            .iter()
            .filter(|(_, p)| p.resume_at <= now)
            .map(|(partition, p)| (*partition, *p))
            .collect();
        due.sort_by_key(|(partition, _)| *partition);
        for (partition, _) in &due {
            self.partitions.remove(partition);
        }
        due
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Option<KafkaMessage>>>,
    },
    Commit {
        offset: KafkaOffset,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Redeliver {
        offset: KafkaOffset,
        delay: Duration,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pending {
        respond_to: oneshot::Sender<Result<Option<usize>>>,
    },
}

type CustodianConsumer = StreamConsumer<KafkaContext>;

struct KafkaActor {
    consumer: Arc<CustodianConsumer>,
    read_timeout: Duration,
    topic: String,
    paused: PausedPartitions,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        crate::apply_raw_config(&mut client_config, config.kafka_raw_config);
        // offsets are only ever committed explicitly, after a record reached a terminal action
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let consumer: Arc<CustodianConsumer> =
            Arc::new(client_config.create_with_context(KafkaContext).map_err(|err| {
                Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                }
            })?);

        // NOTE: Subscribing to a non-existent topic will not return an error, the consumer
        // starts pulling records once the topic is created.
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let mut actor = KafkaActor {
            consumer,
            read_timeout,
            topic: config.topic,
            paused: PausedPartitions::default(),
            handler_rx,
        };

        // subscribe() succeeds even with invalid credentials, talking to the brokers once
        // surfaces those errors before the actor starts.
        let pending = actor
            .pending_messages()
            .await
            .map_err(|err| Error::Kafka(format!("Failed to get pending messages: {err:?}")))?;
        info!(topic = %actor.topic, ?pending, "Connected to Kafka");

        tokio::spawn(async move {
            info!("Starting Kafka consumer...");
            // terminates when the sender end of handler_rx is closed
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let message = self.read_message().await;
                if respond_to.send(message).is_err() {
                    error!("Failed to send record from Kafka actor, receiver dropped");
                }
            }
            KafkaActorMessage::Commit { offset, respond_to } => {
                let status = self.commit(offset).await;
                if respond_to.send(status).is_err() {
                    error!("Failed to send commit status from Kafka actor, receiver dropped");
                }
            }
            KafkaActorMessage::Redeliver {
                offset,
                delay,
                respond_to,
            } => {
                let status = self.redeliver(offset, delay);
                if respond_to.send(status).is_err() {
                    error!("Failed to send redeliver status from Kafka actor, receiver dropped");
                }
            }
            KafkaActorMessage::Pending { respond_to } => {
                let pending = self.pending_messages().await;
                if respond_to.send(pending).is_err() {
                    error!("Failed to send pending count from Kafka actor, receiver dropped");
                }
            }
        }
    }

    /// Waits up to `read_timeout` for the next record of a partition that is not paused.
    async fn read_message(&mut self) -> Result<Option<KafkaMessage>> {
        self.resume_due_partitions().await;

        let consumer = Arc::clone(&self.consumer);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        // Return error if the number of continuous failures exceeds MAX_FAILURE_COUNT
        // A successful read will reset the failure count
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        loop {
            let next_resume = self.paused.next_resume_at();
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    return Ok(None);
                }

                _ = wait_until(next_resume) => {
                    self.resume_due_partitions().await;
                }

                message = consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read message, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    if self.paused.is_paused(message.partition()) {
                        // prefetched before the pause, the rewind fetches it again
                        debug!(
                            partition = message.partition(),
                            offset = message.offset(),
                            "Discarding record of a partition awaiting redelivery"
                        );
                        continue;
                    }

                    return Ok(Some(KafkaMessage::from_message(&message)));
                }
            }
        }
    }

    async fn commit(&mut self, offset: KafkaOffset) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // The committed offset is the position of the next record to be read.
        tpl.add_partition_offset(&offset.topic, offset.partition, Offset::Offset(offset.offset + 1))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset for commit: {e}")))?;

        // commit with CommitMode::Sync blocks until the broker confirms
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Kafka(format!("Waiting for spawned commit task to complete: {e:?}")))?
    }

    /// Pauses the partition of `offset`. Once `delay` elapsed the partition is rewound to the
    /// offset and resumed, which re-presents the same record.
    fn redeliver(&mut self, offset: KafkaOffset, delay: Duration) -> Result<()> {
        if offset.topic != self.topic {
            return Err(Error::Other(format!(
                "Offset of topic {} does not belong to subscribed topic {}",
                offset.topic, self.topic
            )));
        }
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, offset.partition);
        self.consumer
            .pause(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to pause partition: {e}")))?;
        self.paused
            .pause(offset.partition, offset.offset, delay, Instant::now());
        debug!(
            partition = offset.partition,
            offset = offset.offset,
            ?delay,
            "Paused partition for redelivery"
        );
        Ok(())
    }

    async fn resume_due_partitions(&mut self) {
        for (partition, paused) in self.paused.take_due(Instant::now()) {
            match self.rewind_and_resume(partition, paused.rewind_to).await {
                Ok(()) => {
                    info!(
                        partition,
                        offset = paused.rewind_to,
                        "Resumed partition for redelivery"
                    );
                }
                Err(e) if !self.is_assigned(partition) => {
                    // the new owner reads from the committed offset
                    warn!(
                        ?e,
                        partition, "Partition is no longer assigned, dropping pending redelivery"
                    );
                }
                Err(e) => {
                    error!(?e, partition, "Failed to resume partition, will try again");
                    self.paused
                        .pause(partition, paused.rewind_to, paused.delay, Instant::now());
                }
            }
        }
    }

    async fn rewind_and_resume(&self, partition: i32, rewind_to: i64) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        // seek may block until the fetcher acknowledges the new position
        tokio::task::spawn_blocking(move || {
            consumer
                .seek(&topic, partition, Offset::Offset(rewind_to), BROKER_CALL_TIMEOUT)
                .map_err(|e| Error::Kafka(format!("Failed to seek partition: {e}")))?;
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, partition);
            consumer
                .resume(&tpl)
                .map_err(|e| Error::Kafka(format!("Failed to resume partition: {e}")))
        })
        .await
        .map_err(|e| Error::Kafka(format!("Waiting for spawned seek task to complete: {e:?}")))?
    }

    fn is_assigned(&self, partition: i32) -> bool {
        match self.consumer.assignment() {
            Ok(tpl) => tpl.find_partition(&self.topic, partition).is_some(),
            Err(e) => {
                warn!(?e, "Failed to fetch partition assignment");
                true
            }
        }
    }

    /// Returns the number of records not yet committed, summed over the partitions of the topic
    /// as (high watermark - committed offset).
    async fn pending_messages(&mut self) -> Result<Option<usize>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();

        // fetch_metadata, committed_offsets and fetch_watermarks are blocking calls
        let handle = tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), BROKER_CALL_TIMEOUT)
                .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;
            let Some(topic_metadata) = metadata.topics().first() else {
                warn!(topic = topic, "No topic metadata found");
                return Ok(0);
            };
            let mut pending = 0;
            for partition in topic_metadata.partitions() {
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition(&topic, partition.id());
                let committed = consumer
                    .committed_offsets(tpl, BROKER_CALL_TIMEOUT)
                    .map_err(|e| Error::Kafka(format!("Failed to get committed offsets: {e}")))?;
                let (low, high) = consumer
                    .fetch_watermarks(&topic, partition.id(), BROKER_CALL_TIMEOUT)
                    .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
                let committed_offset = match committed.elements_for_topic(&topic).first() {
                    Some(element) => match element.offset() {
                        Offset::Offset(offset) => offset,
                        _ => low,
                    },
                    None => low,
                };
                pending += (high - committed_offset).max(0) as usize;
            }
            Ok(pending)
        });

        match handle.await {
            Ok(Ok(pending)) => Ok(Some(pending)),
            Ok(Err(e)) => {
                error!(?e, "Error fetching pending messages");
                Err(e)
            }
            Err(e) => {
                error!(?e, "Tokio task join error fetching pending messages");
                Err(Error::Other(format!("Tokio task join error: {e}")))
            }
        }
    }
}

/// Handle to the Kafka consumer actor. Cheap to clone, all clones talk to the same consumer.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaSource {
    pub async fn connect(config: KafkaSourceConfig, read_timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, read_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Returns the next record, or `None` if nothing arrived within the read timeout.
    pub async fn read_message(&self) -> Result<Option<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        self.send(KafkaActorMessage::Read { respond_to: tx }).await?;
        rx.await.map_err(|_| Error::ActorTerminated)?
    }

    /// Commits the record at `offset`, the next read of that partition starts after it.
    pub async fn commit(&self, offset: KafkaOffset) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(KafkaActorMessage::Commit {
            offset,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::ActorTerminated)?
    }

    /// Makes the record at `offset` available again no sooner than `delay` from now, without
    /// advancing past it. The partition delivers nothing else in the meantime.
    pub async fn redeliver_after(&self, offset: KafkaOffset, delay: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(KafkaActorMessage::Redeliver {
            offset,
            delay,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::ActorTerminated)?
    }

    pub async fn pending_messages(&self) -> Result<Option<usize>> {
        let (tx, rx) = oneshot::channel();
        self.send(KafkaActorMessage::Pending { respond_to: tx })
            .await?;
        rx.await.map_err(|_| Error::ActorTerminated)?
    }

    async fn send(&self, msg: KafkaActorMessage) -> Result<()> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::ActorTerminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_partitions_due() {
        let now = Instant::now();
        let mut paused = PausedPartitions::default();
        paused.pause(1, 10, Duration::from_millis(100), now);
        paused.pause(0, 4, Duration::from_millis(50), now);

        assert!(paused.is_paused(0));
        assert!(paused.is_paused(1));
        assert!(!paused.is_paused(2));
        assert_eq!(
            paused.next_resume_at(),
            Some(now + Duration::from_millis(50))
        );

        assert!(paused.take_due(now).is_empty());

        let due = paused.take_due(now + Duration::from_millis(60));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 0);
        assert_eq!(due[0].1.rewind_to, 4);
        assert!(!paused.is_paused(0));

        let due = paused.take_due(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
        assert_eq!(paused.next_resume_at(), None);
    }

    #[test]
    fn test_paused_partition_keeps_lowest_offset() {
        let now = Instant::now();
        let mut paused = PausedPartitions::default();
        paused.pause(3, 20, Duration::from_millis(10), now);
        paused.pause(3, 15, Duration::from_millis(30), now);
        paused.pause(3, 25, Duration::from_millis(5), now);

        let due = paused.take_due(now + Duration::from_millis(30));
        assert_eq!(due.len(), 1);
        let (_, entry) = due[0];
        assert_eq!(entry.rewind_to, 15);
        assert_eq!(entry.resume_at, now + Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_until_none_never_completes() {
        let waited =
            tokio::time::timeout(Duration::from_millis(20), wait_until(None)).await;
        assert!(waited.is_err());

        let deadline = Instant::now() + Duration::from_millis(5);
        let waited =
            tokio::time::timeout(Duration::from_millis(500), wait_until(Some(deadline))).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_actor_reports_termination() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let source = KafkaSource { actor_tx: tx };
        let err = source.read_message().await.unwrap_err();
        assert!(matches!(err, Error::ActorTerminated));
    }

    #[cfg(feature = "kafka-tests")]
    mod broker {
        use super::super::*;
        use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
        use rdkafka::producer::{FutureProducer, FutureRecord};

        async fn setup_topic_with_records(count: usize) -> String {
            let topic = format!(
                "custodian_source_test_{}",
                uuid::Uuid::new_v4().to_string().replace('-', "")
            );
            let admin = ClientConfig::new()
                .set("bootstrap.servers", "localhost:9092")
                .create::<AdminClient<_>>()
                .expect("Failed to create admin client");
            admin
                .create_topics(
                    &[NewTopic::new(&topic, 1, TopicReplication::Fixed(1))],
                    &AdminOptions::new(),
                )
                .await
                .expect("Failed to create topic");

            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", "localhost:9092")
                .create()
                .expect("Failed to create producer");
            for i in 0..count {
                let payload = format!("record-{i}");
                producer
                    .send(
                        FutureRecord::<String, _>::to(&topic).payload(&payload),
                        Duration::from_secs(5),
                    )
                    .await
                    .expect("Failed to produce");
            }
            topic
        }

        fn source_config(topic: &str) -> KafkaSourceConfig {
            KafkaSourceConfig {
                brokers: vec!["localhost:9092".to_string()],
                topic: topic.to_string(),
                consumer_group: format!("custodian-test-{}", uuid::Uuid::new_v4()),
                auth: None,
                tls: None,
                kafka_raw_config: HashMap::new(),
            }
        }

        async fn next(source: &KafkaSource) -> KafkaMessage {
            for _ in 0..20 {
                if let Some(msg) = source.read_message().await.unwrap() {
                    return msg;
                }
            }
            panic!("no record received");
        }

        #[tokio::test]
        async fn test_redeliver_presents_same_record_again() {
            let topic = setup_topic_with_records(2).await;
            let source = KafkaSource::connect(source_config(&topic), Duration::from_millis(500))
                .await
                .unwrap();

            let first = next(&source).await;
            assert_eq!(first.value, Bytes::from("record-0"));

            let started = Instant::now();
            source
                .redeliver_after(first.offset(), Duration::from_millis(300))
                .await
                .unwrap();

            let again = next(&source).await;
            assert!(started.elapsed() >= Duration::from_millis(300));
            assert_eq!(again.offset, first.offset);
            assert_eq!(again.value, first.value);

            source.commit(again.offset()).await.unwrap();
            let second = next(&source).await;
            assert_eq!(second.value, Bytes::from("record-1"));
            source.commit(second.offset()).await.unwrap();

            assert_eq!(source.pending_messages().await.unwrap(), Some(0));
        }
    }
}
