//! The consumer loop. Reads one record at a time, stores the customer it carries and resolves
//! every attempt into exactly one acknowledgement action:
//!
//! - stored: commit
//! - store unreachable: redeliver after the retry delay
//! - any other failure: dead-letter, then commit; redeliver if the dead-letter write failed
//!
//! Records are processed sequentially, the next read is issued only after the previous record
//! was acknowledged.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::ack::{AckController, Acknowledger};
use crate::classifier::{Failure, FailureClassification, classify};
use crate::dead_letter::{DeadLetterForwarder, DeadLetterSink};
use crate::error::{Error, Result};
use crate::message::{ProcessingOutcome, Record};
use crate::source::RecordSource;
use crate::store::PersistenceGateway;

/// Drives records from the source to the store. Every attempt runs inside a `consume` span
/// carrying the topic, partition and offset of the record, which scopes all the log events of
/// the attempt, including those of the collaborators.
pub(crate) struct Consumer<S, A, G, D> {
    source: S,
    ack: AckController<A>,
    gateway: G,
    forwarder: DeadLetterForwarder<D>,
    retry_delay: Duration,
}

impl<S, A, G, D> Consumer<S, A, G, D>
where
    S: RecordSource,
    A: Acknowledger,
    G: PersistenceGateway,
    D: DeadLetterSink,
{
    pub(crate) fn new(
        source: S,
        acker: A,
        gateway: G,
        forwarder: DeadLetterForwarder<D>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            source,
            ack: AckController::new(acker),
            gateway,
            forwarder,
            retry_delay,
        }
    }

    /// Runs until the token is cancelled or the source is gone for good. A record in flight when
    /// the token is cancelled is finished first.
    pub(crate) async fn run(mut self, cln_token: CancellationToken) -> Result<()> {
        let source = self.source.name();
        match self.source.pending().await {
            Ok(pending) => info!(source, ?pending, "Starting consumer"),
            Err(e) => warn!(source, ?e, "Starting consumer, pending records unknown"),
        }
        loop {
            let read = tokio::select! {
                biased;

                _ = cln_token.cancelled() => {
                    info!("Cancellation token received, stopping consumer");
                    break;
                }
                read = self.source.read() => read,
            };

            match read {
                Ok(Some(record)) => {
                    self.consume(&record, &cln_token).await;
                }
                Ok(None) => {}
                Err(Error::ActorPatternRecv(e)) => {
                    error!(%e, "Source is gone, stopping consumer");
                    return Err(Error::ActorPatternRecv(e));
                }
                Err(e) => {
                    error!(?e, "Failed to read from source");
                    tokio::select! {
                        _ = cln_token.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
        info!("Consumer stopped");
        Ok(())
    }

    /// One processing attempt of the record, acknowledged before returning. A failed redelivery
    /// request is retried until it succeeds or the token is cancelled, reading on would commit
    /// past the record.
    pub(crate) async fn consume(
        &self,
        record: &Record,
        cln_token: &CancellationToken,
    ) -> ProcessingOutcome {
        let span = info_span!(
            "consume",
            topic = %record.offset.topic,
            partition = record.offset.partition,
            offset = record.offset.offset,
        );
        async {
            let outcome = self.process(record).await;
            let Err(e) = self.ack.resolve(&record.offset, outcome).await else {
                return outcome;
            };
            match outcome {
                ProcessingOutcome::Committed | ProcessingOutcome::DeadLettered => {
                    // the record reached the store or the dead-letter topic, a later commit
                    // covers it
                    error!(?e, ?outcome, "Failed to commit record");
                }
                ProcessingOutcome::RedeliverAfter(delay) => {
                    error!(?e, "Failed to request redelivery, retrying");
                    self.retry_redelivery(record, delay, cln_token).await;
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn retry_redelivery(
        &self,
        record: &Record,
        delay: Duration,
        cln_token: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cln_token.cancelled() => {
                    warn!("Cancellation token received, record is left unacknowledged");
                    return;
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
            match self.ack.redeliver_after(&record.offset, delay).await {
                Ok(()) => return,
                Err(e) => error!(?e, "Failed to request redelivery, retrying"),
            }
        }
    }

    async fn process(&self, record: &Record) -> ProcessingOutcome {
        let failure = match self.store(record).await {
            Ok(()) => return ProcessingOutcome::Committed,
            Err(failure) => failure,
        };

        match classify(&failure) {
            FailureClassification::Transient => {
                error!(
                    %failure,
                    retry_in = ?self.retry_delay,
                    "Store unavailable, record will be redelivered"
                );
                ProcessingOutcome::RedeliverAfter(self.retry_delay)
            }
            FailureClassification::Unknown => {
                error!(%failure, "Failed to process record");
                match self
                    .forwarder
                    .forward(record, &record.source_topic, &failure.to_string())
                    .await
                {
                    Ok(()) => ProcessingOutcome::DeadLettered,
                    Err(_) => {
                        warn!(
                            retry_in = ?self.retry_delay,
                            "Record could not be dead-lettered, it will be redelivered"
                        );
                        ProcessingOutcome::RedeliverAfter(self.retry_delay)
                    }
                }
            }
        }
    }

    async fn store(&self, record: &Record) -> std::result::Result<(), Failure> {
        let customer = match record.customer() {
            Ok(customer) => customer,
            Err(e) => {
                info!(key = ?record.partition_key, "Starting consumption of undecodable record");
                return Err(e.into());
            }
        };
        info!(
            key = ?record.partition_key,
            id = %customer.id,
            received_at = record.received_timestamp,
            "Starting consumption"
        );
        self.gateway.save(&customer).await?;
        Ok(())
    }
}
