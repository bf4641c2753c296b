//! EventStore — append-only log of immutable domain events, backed by Postgres.
//!
//! Commits are guarded by an expected-version precondition; races between
//! writers that both passed the precondition are detected by the
//! (stream, version) unique constraint and resolved by retrying with
//! exponential backoff.

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::error::EventStoreError;
use crate::stream::EventStream;
use crate::types::{
    Events, ExpectedVersion, MaybeVersion, SequenceNumber, StreamName, StreamSelector, Version,
};

/// Retry budget for (stream, version) races: 8 retries with doubling waits
/// starting at 5ms, ~1275ms asleep worst case.
const MAX_RETRY_ATTEMPTS: u32 = 8;
const RETRY_BASE_WAIT: Duration = Duration::from_millis(5);

fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_WAIT * 2u32.pow(attempt)
}

/// Version and sequence number of the last event committed in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub version: Version,
    pub sequence_number: SequenceNumber,
}

/// Outcome of an idempotent schema setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupResult {
    pub message: String,
}

/// Store health as reported by [`EventStore::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error(String),
}

/// Writer/reader facade over one event table. Cheap to clone; the pool is
/// shared.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
    table: String,
}

impl EventStore {
    /// `table` names the event table; it comes from configuration, not user
    /// input, and is interpolated into SQL verbatim.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Append `events` to `stream_name` if `expected_version` holds.
    ///
    /// The whole batch shares one transaction and one recorded-at timestamp:
    /// all events become visible together or not at all. A precondition
    /// mismatch fails immediately with
    /// [`EventStoreError::VersionMismatch`]; a (stream, version) race with a
    /// concurrent writer is retried until the budget runs out, then fails
    /// with [`EventStoreError::Concurrency`].
    pub async fn commit(
        &self,
        stream_name: &StreamName,
        events: Events,
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_commit(stream_name, &events, expected_version).await {
                Err(EventStoreError::Storage(err)) if is_unique_violation(&err) => {
                    if attempt >= MAX_RETRY_ATTEMPTS {
                        return Err(EventStoreError::Concurrency { attempts: attempt });
                    }
                    warn!(
                        stream = %stream_name,
                        attempt,
                        "commit lost a (stream, version) race, retrying"
                    );
                    tokio::time::sleep(retry_delay(attempt)).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// One read-verify-insert pass. The transaction rolls back on drop if any
    /// step fails.
    async fn try_commit(
        &self,
        stream_name: &StreamName,
        events: &Events,
        expected_version: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        let mut tx = self.pool.begin().await?;

        let current = self.stream_version(&mut tx, stream_name).await?;
        expected_version.verify(stream_name, current)?;

        let insert = format!(
            "INSERT INTO {} (event_id, stream, version, event_type, payload, metadata, \
             correlation_id, causation_id, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING sequence_number",
            self.table
        );
        let recorded_at = Utc::now();
        let mut version = current.next_version();
        let mut last_version = version;
        let mut last_sequence_number: i64 = 0;
        for event in events.iter() {
            let (sequence_number,): (i64,) = sqlx::query_as(&insert)
                .bind(event.id.as_str())
                .bind(stream_name.as_str())
                .bind(version.value())
                .bind(event.event_type.as_str())
                .bind(event.data.as_str())
                .bind(event.metadata.to_json())
                .bind(event.metadata.get_str(crate::types::EventMetadata::CORRELATION_ID))
                .bind(event.metadata.get_str(crate::types::EventMetadata::CAUSATION_ID))
                .bind(recorded_at)
                .fetch_one(&mut *tx)
                .await?;
            last_version = version;
            last_sequence_number = sequence_number;
            version = version.next();
        }
        tx.commit().await?;

        Ok(CommitResult {
            version: last_version,
            sequence_number: SequenceNumber::from(last_sequence_number),
        })
    }

    async fn stream_version(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stream_name: &StreamName,
    ) -> Result<MaybeVersion, EventStoreError> {
        let query = format!("SELECT MAX(version) FROM {} WHERE stream = $1", self.table);
        let max: Option<i64> = sqlx::query_scalar(&query)
            .bind(stream_name.as_str())
            .fetch_one(&mut **tx)
            .await?;
        Ok(MaybeVersion::from(max.map(Version::from)))
    }

    /// Build a cursor over a concrete or virtual stream. No I/O happens here;
    /// the query runs when the cursor is iterated.
    pub fn load(&self, selector: impl Into<StreamSelector>) -> EventStream {
        EventStream::new(self.pool.clone(), self.table.clone(), selector.into())
    }

    /// Remove every event of `stream_name`. Returns the number of rows
    /// deleted. Sequence numbers of other events are unaffected.
    pub async fn delete_stream(&self, stream_name: &StreamName) -> Result<u64, EventStoreError> {
        let query = format!("DELETE FROM {} WHERE stream = $1", self.table);
        let result = sqlx::query(&query)
            .bind(stream_name.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Idempotently create the event table and its constraints.
    pub async fn setup(&self) -> Result<SetupResult, EventStoreError> {
        let table = &self.table;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                sequence_number BIGSERIAL    PRIMARY KEY,
                stream          VARCHAR(255) NOT NULL,
                version         BIGINT       NOT NULL,
                event_type      VARCHAR(255) NOT NULL,
                payload         TEXT         NOT NULL,
                metadata        TEXT         NOT NULL,
                event_id        VARCHAR(255) NOT NULL,
                correlation_id  VARCHAR(255),
                causation_id    VARCHAR(255),
                recorded_at     TIMESTAMPTZ  NOT NULL,
                CONSTRAINT {table}_event_id_uniq UNIQUE (event_id),
                CONSTRAINT {table}_stream_version_uniq UNIQUE (stream, version)
            )
            "#
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_correlation_idx ON {table} (correlation_id)"
        );
        sqlx::query(&index).execute(&self.pool).await?;
        Ok(SetupResult {
            message: format!("event table \"{table}\" is ready"),
        })
    }

    /// Health probe. Not implemented yet; callers treat this as unknown.
    pub fn status(&self) -> Status {
        Status::Error("not implemented".to_owned())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
