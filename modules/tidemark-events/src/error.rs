use thiserror::Error;

use crate::types::{ExpectedVersion, MaybeVersion, StreamName};

/// Failure modes of the event store.
///
/// `VersionMismatch` and `Concurrency` are expected, recoverable conditions
/// a writer handles at the application level; everything else is an
/// infrastructure failure or a defect.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected-version precondition did not hold. Surfaced immediately,
    /// never retried: the caller's view of the stream is genuinely stale.
    #[error("expected {expected} for stream \"{stream}\" but found {actual}")]
    VersionMismatch {
        stream: StreamName,
        expected: ExpectedVersion,
        actual: MaybeVersion,
    },

    /// A concurrent writer kept winning the (stream, version) race until the
    /// retry budget ran out.
    #[error("commit failed after {attempts} concurrency retries")]
    Concurrency { attempts: u32 },

    /// A persisted row could not be decoded back into an envelope. Fatal to
    /// the current iteration only; the store itself is not affected.
    #[error("corrupt record for event \"{event_id}\": {detail}")]
    CorruptRecord { event_id: String, detail: String },

    /// Any other storage failure, propagated unwrapped. Not retried.
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

impl EventStoreError {
    pub(crate) fn corrupt(event_id: &str, detail: impl std::fmt::Display) -> Self {
        Self::CorruptRecord {
            event_id: event_id.to_owned(),
            detail: detail.to_string(),
        }
    }
}
