//! Catch-up driver: bracket a subscriber's read-apply loop between
//! checkpoint acquisition and release.

use std::future::Future;

use futures::{pin_mut, StreamExt};
use thiserror::Error;
use tidemark_events::{EventEnvelope, EventStore, EventStoreError, SequenceNumber, StreamSelector};
use tracing::debug;

use crate::checkpoint::{CheckpointError, CheckpointStore};

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The subscriber's own handler failed. Progress made before the failure
    /// is already persisted.
    #[error("event handler failed: {0}")]
    Apply(#[source] anyhow::Error),
}

/// Run one catch-up pass for the subscriber behind `checkpoint_store`.
///
/// Acquires the checkpoint, streams every event after it in global order
/// through `apply`, and releases by persisting the highest sequence number
/// that was applied — also on failure, so a rerun resumes after the last
/// good event. Returns the new checkpoint.
pub async fn catch_up<F, Fut>(
    event_store: &EventStore,
    checkpoint_store: &CheckpointStore,
    mut apply: F,
) -> Result<SequenceNumber, CatchUpError>
where
    F: FnMut(EventEnvelope) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let last_applied = checkpoint_store.acquire_lock().await?;
    let mut highest = last_applied;

    let cursor = event_store
        .load(StreamSelector::All)
        .with_minimum_sequence_number(last_applied.next());
    let envelopes = cursor.envelopes();
    pin_mut!(envelopes);

    let mut outcome = Ok(());
    while let Some(next) = envelopes.next().await {
        match next {
            Ok(envelope) => {
                let sequence_number = envelope.sequence_number;
                if let Err(err) = apply(envelope).await {
                    outcome = Err(CatchUpError::Apply(err));
                    break;
                }
                highest = sequence_number;
            }
            Err(err) => {
                outcome = Err(err.into());
                break;
            }
        }
    }

    debug!(
        subscriber = checkpoint_store.subscriber_id(),
        from = last_applied.value(),
        to = highest.value(),
        "catch-up pass finished"
    );
    checkpoint_store.update_and_release_lock(highest).await?;
    outcome.map(|()| highest)
}
