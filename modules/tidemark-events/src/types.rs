//! Core types for the event store. Domain-agnostic.
//!
//! Events are caller-constructed, immutable values; the store assigns
//! versions and sequence numbers at commit time and hands back
//! [`EventEnvelope`]s on the read side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventStoreError;

// ---------------------------------------------------------------------------
// Event identity and payload
// ---------------------------------------------------------------------------

/// Caller-supplied, globally unique event identifier. Enforced by a unique
/// constraint at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh UUID v4 identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespaced event classifier, conventionally `<context>:<type>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque serialized payload. The store never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(String);

impl EventData {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// String-keyed metadata attached to an event, stored as a JSON object.
///
/// The well-known keys [`EventMetadata::CORRELATION_ID`] and
/// [`EventMetadata::CAUSATION_ID`] are mirrored into indexed columns at
/// commit time so correlation groups can be read back as virtual streams.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(serde_json::Map<String, serde_json::Value>);

impl EventMetadata {
    pub const CORRELATION_ID: &'static str = "correlationIdentifier";
    pub const CAUSATION_ID: &'static str = "causationIdentifier";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The value under `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    pub fn to_json(&self) -> String {
        serde_json::Value::Object(self.0.clone()).to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// An immutable domain event, built by the caller before commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub data: EventData,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(
        id: EventId,
        event_type: EventType,
        data: EventData,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id,
            event_type,
            data,
            metadata,
        }
    }
}

/// A non-empty, ordered batch of events committed as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Events(Vec<Event>);

impl Events {
    pub fn single(event: Event) -> Self {
        Self(vec![event])
    }

    /// `None` if `events` is empty — a commit must carry at least one event.
    pub fn from_vec(events: Vec<Event>) -> Option<Self> {
        if events.is_empty() {
            None
        } else {
            Some(Self(events))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Stream addressing
// ---------------------------------------------------------------------------

/// A concrete, named partition of the log, conventionally `<context>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a read addresses: a concrete stream or one of the virtual streams.
///
/// Virtual streams are read-only views; only concrete streams are write
/// targets. This is a closed set — no further addressing kinds exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelector {
    /// Exactly one named stream.
    Stream(StreamName),
    /// Every event in the log.
    All,
    /// All streams whose name starts with the given prefix.
    Category(String),
    /// All events whose metadata carries the given correlation identifier.
    Correlation(String),
}

impl StreamSelector {
    pub fn category(prefix: impl Into<String>) -> Self {
        Self::Category(prefix.into())
    }

    pub fn correlation(id: impl Into<String>) -> Self {
        Self::Correlation(id.into())
    }
}

impl From<StreamName> for StreamSelector {
    fn from(stream_name: StreamName) -> Self {
        Self::Stream(stream_name)
    }
}

impl From<&StreamName> for StreamSelector {
    fn from(stream_name: &StreamName) -> Self {
        Self::Stream(stream_name.clone())
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Per-stream position, 1-based and gapless within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global commit-order cursor across the entire log, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// The position before any event; the seed value of a fresh checkpoint.
    pub fn none() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stream's current version, or nothing if the stream has no events yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaybeVersion(Option<Version>);

impl MaybeVersion {
    pub fn version(self) -> Option<Version> {
        self.0
    }

    /// The version the next committed event gets: 1 for a fresh stream,
    /// current + 1 otherwise.
    pub fn next_version(self) -> Version {
        match self.0 {
            Some(version) => version.next(),
            None => Version::first(),
        }
    }
}

impl From<Option<Version>> for MaybeVersion {
    fn from(version: Option<Version>) -> Self {
        Self(version)
    }
}

impl std::fmt::Display for MaybeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(version) => write!(f, "version {version}"),
            None => write!(f, "no stream"),
        }
    }
}

// ---------------------------------------------------------------------------
// Concurrency precondition
// ---------------------------------------------------------------------------

/// The caller's expectation about a stream's current version, checked before
/// any row is written. A mismatch is a business-level conflict and is never
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check; the commit appends regardless of stream state.
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must exist, at any version.
    StreamExists,
    /// The stream must be at exactly this version.
    Exact(Version),
}

impl ExpectedVersion {
    pub fn verify(
        self,
        stream_name: &StreamName,
        actual: MaybeVersion,
    ) -> Result<(), EventStoreError> {
        let satisfied = match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual.version().is_none(),
            ExpectedVersion::StreamExists => actual.version().is_some(),
            ExpectedVersion::Exact(expected) => actual.version() == Some(expected),
        };
        if satisfied {
            Ok(())
        } else {
            Err(EventStoreError::VersionMismatch {
                stream: stream_name.clone(),
                expected: self,
                actual,
            })
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any version"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::StreamExists => write!(f, "an existing stream"),
            ExpectedVersion::Exact(version) => write!(f, "version {version}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Read-side representation
// ---------------------------------------------------------------------------

/// A persisted event together with its position in the log. Created only by
/// the read path; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: Event,
    pub stream_name: StreamName,
    pub version: Version,
    pub sequence_number: SequenceNumber,
    pub recorded_at: DateTime<Utc>,
}
