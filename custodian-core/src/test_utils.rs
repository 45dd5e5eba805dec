//! In-memory collaborators of the consumer loop, used by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ack::Acknowledger;
use crate::dead_letter::{DeadLetterEnvelope, DeadLetterSink};
use crate::error::{Error, Result};
use crate::message::{Customer, Offset, Record};
use crate::source::RecordSource;
use crate::store::{PersistenceGateway, StoreError, StoreResult};

pub(crate) const INPUT_TOPIC: &str = "input-topic";

pub(crate) fn offset(offset: i64) -> Offset {
    Offset {
        topic: INPUT_TOPIC.to_string(),
        partition: 0,
        offset,
    }
}

pub(crate) fn record(payload: &str) -> Record {
    record_at(payload, 0)
}

pub(crate) fn record_at(payload: &str, at: i64) -> Record {
    Record {
        payload: Bytes::from(payload.to_string()),
        partition_key: None,
        source_topic: INPUT_TOPIC.to_string(),
        received_timestamp: 1_700_000_000_000,
        offset: offset(at),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckAction {
    Commit(Offset),
    RedeliverAfter(Offset, Duration),
}

/// Records every acknowledgement action in order.
#[derive(Clone, Default)]
pub(crate) struct FakeAcknowledger {
    actions: Arc<Mutex<Vec<AckAction>>>,
    fail: bool,
    /// redelivery requests still to be refused
    redelivery_failures: Arc<Mutex<usize>>,
    redelivery_attempts: Arc<Mutex<usize>>,
}

impl FakeAcknowledger {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Refuses the next `failures` redelivery requests, commits always succeed.
    pub(crate) fn failing_redeliveries(failures: usize) -> Self {
        Self {
            redelivery_failures: Arc::new(Mutex::new(failures)),
            ..Default::default()
        }
    }

    pub(crate) fn redelivery_attempts(&self) -> usize {
        *self.redelivery_attempts.lock()
    }

    pub(crate) fn actions(&self) -> Vec<AckAction> {
        self.actions.lock().clone()
    }

    pub(crate) fn commits(&self) -> usize {
        self.actions()
            .iter()
            .filter(|a| matches!(a, AckAction::Commit(_)))
            .count()
    }

    pub(crate) fn redeliveries(&self) -> Vec<Duration> {
        self.actions()
            .iter()
            .filter_map(|a| match a {
                AckAction::RedeliverAfter(_, delay) => Some(*delay),
                AckAction::Commit(_) => None,
            })
            .collect()
    }
}

impl Acknowledger for FakeAcknowledger {
    async fn commit(&self, offset: &Offset) -> Result<()> {
        if self.fail {
            return Err(Error::Ack("broker unavailable".to_string()));
        }
        self.actions.lock().push(AckAction::Commit(offset.clone()));
        Ok(())
    }

    async fn redeliver_after(&self, offset: &Offset, delay: Duration) -> Result<()> {
        *self.redelivery_attempts.lock() += 1;
        if self.fail {
            return Err(Error::Ack("broker unavailable".to_string()));
        }
        {
            let mut failures = self.redelivery_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Ack("partition pause failed".to_string()));
            }
        }
        self.actions
            .lock()
            .push(AckAction::RedeliverAfter(offset.clone(), delay));
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
enum SinkBehaviour {
    #[default]
    Accept,
    Fail,
    Hang,
}

/// Dead-letter destination that keeps the published envelopes.
#[derive(Clone, Default)]
pub(crate) struct FakeDeadLetterSink {
    published: Arc<Mutex<Vec<DeadLetterEnvelope>>>,
    behaviour: Arc<Mutex<SinkBehaviour>>,
}

impl FakeDeadLetterSink {
    pub(crate) fn failing() -> Self {
        let sink = Self::default();
        *sink.behaviour.lock() = SinkBehaviour::Fail;
        sink
    }

    /// Never confirms a publish.
    pub(crate) fn hanging() -> Self {
        let sink = Self::default();
        *sink.behaviour.lock() = SinkBehaviour::Hang;
        sink
    }

    pub(crate) fn recover(&self) {
        *self.behaviour.lock() = SinkBehaviour::Accept;
    }

    pub(crate) fn published(&self) -> Vec<DeadLetterEnvelope> {
        self.published.lock().clone()
    }
}

impl DeadLetterSink for FakeDeadLetterSink {
    async fn publish(&self, envelope: DeadLetterEnvelope, _timeout: Duration) -> Result<()> {
        let behaviour = *self.behaviour.lock();
        match behaviour {
            SinkBehaviour::Accept => {
                self.published.lock().push(envelope);
                Ok(())
            }
            SinkBehaviour::Fail => {
                Err(Error::DeadLetter("broker rejected the write".to_string()))
            }
            SinkBehaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Store whose next results can be scripted. Once the script is exhausted every write succeeds.
#[derive(Clone, Default)]
pub(crate) struct FakeGateway {
    results: Arc<Mutex<VecDeque<StoreResult<()>>>>,
    saved: Arc<Mutex<Vec<Customer>>>,
    calls: Arc<Mutex<usize>>,
}

impl FakeGateway {
    pub(crate) fn with_results(results: Vec<StoreResult<()>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            ..Default::default()
        }
    }

    pub(crate) fn failing_with(err: StoreError) -> Self {
        Self::with_results(vec![Err(err)])
    }

    pub(crate) fn saved(&self) -> Vec<Customer> {
        self.saved.lock().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl PersistenceGateway for FakeGateway {
    async fn save(&self, customer: &Customer) -> StoreResult<()> {
        *self.calls.lock() += 1;
        let result = self.results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.saved.lock().push(customer.clone());
        }
        result
    }
}

/// Source replaying a fixed list of records, then reporting nothing to read.
#[derive(Default)]
pub(crate) struct FakeSource {
    records: VecDeque<Result<Option<Record>>>,
}

impl FakeSource {
    pub(crate) fn new(records: Vec<Result<Option<Record>>>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

impl RecordSource for FakeSource {
    fn name(&self) -> &'static str {
        "Fake"
    }

    async fn read(&mut self) -> Result<Option<Record>> {
        match self.records.pop_front() {
            Some(next) => next,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(None)
            }
        }
    }

    async fn pending(&self) -> Result<Option<usize>> {
        Ok(Some(self.records.len()))
    }
}
