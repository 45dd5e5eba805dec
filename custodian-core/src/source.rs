use crate::Result;
use crate::message::Record;

/// [Kafka] consumer adapter, it is both the [RecordSource] and the
/// [crate::ack::Acknowledger] of the consumer loop.
///
/// [Kafka]: https://kafka.apache.org/
pub(crate) mod kafka;

/// Read side of the upstream client. Records arrive one at a time, in partition order.
#[trait_variant::make(RecordSource: Send)]
#[allow(dead_code)]
pub(crate) trait LocalRecordSource {
    /// Name of the source.
    fn name(&self) -> &'static str;

    /// Returns the next record, or `None` if nothing arrived within the read timeout.
    async fn read(&mut self) -> Result<Option<Record>>;

    /// Records not yet committed by the consumer group, `None` if the source can not tell.
    async fn pending(&self) -> Result<Option<usize>>;
}
