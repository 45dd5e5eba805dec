//! A [Record] is one unit of work read from the input topic. It is owned by the consumer loop
//! until it reaches a terminal action, which is described by a [ProcessingOutcome].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position of a record in the input stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Offset {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

/// The record read from the input topic. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Record {
    /// raw payload, forwarded unmodified to the dead-letter topic
    pub(crate) payload: Bytes,
    pub(crate) partition_key: Option<String>,
    pub(crate) source_topic: String,
    /// milliseconds since epoch, 0 when the broker did not provide one
    pub(crate) received_timestamp: i64,
    pub(crate) offset: Offset,
}

impl Record {
    /// Decodes the payload into the [Customer] entity.
    pub(crate) fn customer(&self) -> serde_json::Result<Customer> {
        serde_json::from_slice(&self.payload)
    }
}

/// The entity carried by the records of the input topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Customer {
    /// unique business identifier
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) email: Option<String>,
}

/// Terminal action of a single processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessingOutcome {
    /// Stored, the offset moves past the record.
    Committed,
    /// Present the same record again once the delay elapsed.
    RedeliverAfter(Duration),
    /// Written to the dead-letter topic, the offset moves past the record.
    DeadLettered,
}
