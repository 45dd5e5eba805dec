use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::message::{Offset, ProcessingOutcome};

/// Acknowledgement side of the upstream client.
#[trait_variant::make(Acknowledger: Send)]
#[allow(dead_code)]
pub(crate) trait LocalAcknowledger {
    /// Advances the durable cursor past the record at `offset`.
    async fn commit(&self, offset: &Offset) -> Result<()>;

    /// Re-presents the record at `offset` no sooner than `delay` from now, without advancing the
    /// cursor. Nothing else of the partition is delivered meanwhile.
    async fn redeliver_after(&self, offset: &Offset, delay: Duration) -> Result<()>;
}

/// Turns the outcome of a processing attempt into exactly one acknowledgement action.
pub(crate) struct AckController<A> {
    acker: A,
}

impl<A> AckController<A>
where
    A: Acknowledger,
{
    pub(crate) fn new(acker: A) -> Self {
        Self { acker }
    }

    pub(crate) async fn commit(&self, offset: &Offset) -> Result<()> {
        self.acker.commit(offset).await?;
        info!(%offset, "Commit done");
        Ok(())
    }

    pub(crate) async fn redeliver_after(&self, offset: &Offset, delay: Duration) -> Result<()> {
        self.acker.redeliver_after(offset, delay).await?;
        debug!(%offset, ?delay, "Redelivery requested");
        Ok(())
    }

    /// Commits for [ProcessingOutcome::Committed] and [ProcessingOutcome::DeadLettered],
    /// requests the redelivery otherwise.
    pub(crate) async fn resolve(&self, offset: &Offset, outcome: ProcessingOutcome) -> Result<()> {
        match outcome {
            ProcessingOutcome::Committed | ProcessingOutcome::DeadLettered => {
                self.commit(offset).await
            }
            ProcessingOutcome::RedeliverAfter(delay) => self.redeliver_after(offset, delay).await,
        }
    }
}
