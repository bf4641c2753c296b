//! EventStream — a lazy, composable cursor over the ordered log.
//!
//! Configuration is pure and cheap; no query runs until [`EventStream::envelopes`]
//! is polled. Each call to `envelopes` executes fresh — iterating the same
//! cursor twice runs the query twice.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::EventStoreError;
use crate::types::{
    Event, EventData, EventEnvelope, EventId, EventMetadata, EventType, SequenceNumber,
    StreamName, StreamSelector, Version,
};

/// Rows fetched per round-trip while iterating. Bounds peak memory; consumers
/// still observe one continuous sequence.
const BATCH_SIZE: usize = 100;

/// An immutable query descriptor over the log, ordered by sequence number
/// (ascending unless [`backwards`](EventStream::backwards) is applied).
#[derive(Clone)]
pub struct EventStream {
    pool: PgPool,
    table: String,
    selector: StreamSelector,
    min_sequence_number: Option<SequenceNumber>,
    max_sequence_number: Option<SequenceNumber>,
    limit: Option<usize>,
    backwards: bool,
}

impl EventStream {
    pub(crate) fn new(pool: PgPool, table: String, selector: StreamSelector) -> Self {
        Self {
            pool,
            table,
            selector,
            min_sequence_number: None,
            max_sequence_number: None,
            limit: None,
            backwards: false,
        }
    }

    /// Restrict to sequence numbers >= `sequence_number`.
    pub fn with_minimum_sequence_number(self, sequence_number: SequenceNumber) -> Self {
        if self.min_sequence_number == Some(sequence_number) {
            return self;
        }
        Self {
            min_sequence_number: Some(sequence_number),
            ..self
        }
    }

    /// Restrict to sequence numbers <= `sequence_number`.
    pub fn with_maximum_sequence_number(self, sequence_number: SequenceNumber) -> Self {
        if self.max_sequence_number == Some(sequence_number) {
            return self;
        }
        Self {
            max_sequence_number: Some(sequence_number),
            ..self
        }
    }

    /// Cap the total number of envelopes yielded.
    pub fn limit(self, limit: usize) -> Self {
        if self.limit == Some(limit) {
            return self;
        }
        Self {
            limit: Some(limit),
            ..self
        }
    }

    /// Iterate in descending sequence-number order.
    pub fn backwards(self) -> Self {
        if self.backwards {
            return self;
        }
        Self {
            backwards: true,
            ..self
        }
    }

    /// Execute the query and stream back envelopes.
    ///
    /// The sequence is finite and single-pass; it pages through the table in
    /// batches of [`BATCH_SIZE`] behind the scenes. A row that fails to
    /// decode ends the iteration with
    /// [`EventStoreError::CorruptRecord`].
    pub fn envelopes(
        &self,
    ) -> impl Stream<Item = Result<EventEnvelope, EventStoreError>> + Send + '_ {
        try_stream! {
            // Keyset cursor: the sequence number of the last row yielded.
            let mut last_seen: Option<i64> = None;
            let mut remaining = self.limit;
            loop {
                let page = remaining.map_or(BATCH_SIZE, |r| r.min(BATCH_SIZE));
                if page == 0 {
                    break;
                }
                let rows = self.fetch_batch(last_seen, page).await?;
                let fetched = rows.len();
                for row in rows {
                    let envelope = decode_row(&row)?;
                    last_seen = Some(envelope.sequence_number.value());
                    yield envelope;
                }
                if let Some(r) = remaining.as_mut() {
                    *r -= fetched;
                }
                if fetched < page {
                    break;
                }
            }
        }
    }

    async fn fetch_batch(
        &self,
        last_seen: Option<i64>,
        page: usize,
    ) -> Result<Vec<PgRow>, EventStoreError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT sequence_number, stream, version, event_type, payload, metadata, \
             event_id, recorded_at FROM {} WHERE TRUE",
            self.table
        ));
        match &self.selector {
            StreamSelector::Stream(stream_name) => {
                query.push(" AND stream = ").push_bind(stream_name.as_str());
            }
            StreamSelector::All => {}
            StreamSelector::Category(prefix) => {
                query.push(" AND stream LIKE ").push_bind(format!("{prefix}%"));
            }
            StreamSelector::Correlation(id) => {
                query.push(" AND correlation_id = ").push_bind(id.as_str());
            }
        }
        if let Some(min) = self.min_sequence_number {
            query.push(" AND sequence_number >= ").push_bind(min.value());
        }
        if let Some(max) = self.max_sequence_number {
            query.push(" AND sequence_number <= ").push_bind(max.value());
        }
        if let Some(last_seen) = last_seen {
            if self.backwards {
                query.push(" AND sequence_number < ").push_bind(last_seen);
            } else {
                query.push(" AND sequence_number > ").push_bind(last_seen);
            }
        }
        query.push(if self.backwards {
            " ORDER BY sequence_number DESC"
        } else {
            " ORDER BY sequence_number ASC"
        });
        query.push(" LIMIT ").push_bind(page as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows)
    }
}

/// Decode one persisted row into an envelope. Any failure is classified as a
/// corrupt record carrying the offending event id.
fn decode_row(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let event_id: String = row
        .try_get("event_id")
        .map_err(|err| EventStoreError::corrupt("<unknown>", err))?;
    let corrupt = |err: &dyn std::fmt::Display| EventStoreError::corrupt(&event_id, err);

    let sequence_number: i64 = row.try_get("sequence_number").map_err(|e| corrupt(&e))?;
    let stream: String = row.try_get("stream").map_err(|e| corrupt(&e))?;
    let version: i64 = row.try_get("version").map_err(|e| corrupt(&e))?;
    let event_type: String = row.try_get("event_type").map_err(|e| corrupt(&e))?;
    let payload: String = row.try_get("payload").map_err(|e| corrupt(&e))?;
    let raw_metadata: String = row.try_get("metadata").map_err(|e| corrupt(&e))?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(|e| corrupt(&e))?;
    let metadata = EventMetadata::from_json(&raw_metadata).map_err(|e| corrupt(&e))?;

    Ok(EventEnvelope {
        event: Event {
            id: EventId::new(event_id),
            event_type: EventType::new(event_type),
            data: EventData::new(payload),
            metadata,
        },
        stream_name: StreamName::new(stream),
        version: Version::from(version),
        sequence_number: SequenceNumber::from(sequence_number),
        recorded_at,
    })
}
