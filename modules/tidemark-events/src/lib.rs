//! Tidemark — a durable, ordered log of immutable domain events, partitioned
//! into named streams and backed by Postgres.
//!
//! Writes go through [`EventStore::commit`] under an expected-version
//! precondition; reads come back as lazy [`EventStream`] cursors over
//! global sequence-number order (a concrete stream, a category prefix, a
//! correlation group, or the whole log).

pub mod error;
pub mod store;
pub mod stream;
pub mod types;

pub use error::EventStoreError;
pub use store::{CommitResult, EventStore, SetupResult, Status};
pub use stream::EventStream;
pub use types::{
    Event, EventData, EventEnvelope, EventId, EventMetadata, EventType, Events, ExpectedVersion,
    MaybeVersion, SequenceNumber, StreamName, StreamSelector, Version,
};
