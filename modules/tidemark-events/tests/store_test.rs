//! Integration tests for EventStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use futures::TryStreamExt;
use sqlx::PgPool;
use tidemark_events::{
    Event, EventData, EventEnvelope, EventId, EventMetadata, EventStore, EventStoreError,
    EventType, Events, EventStream, ExpectedVersion, SequenceNumber, Status, StreamName,
    StreamSelector,
};

/// Get a store over a freshly created table, or skip if no test DB is
/// available. Each test uses its own table so tests stay independent.
async fn test_store(table: &str) -> Option<(PgPool, EventStore)> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(&pool)
        .await
        .ok()?;
    let store = EventStore::new(pool.clone(), table);
    store.setup().await.ok()?;
    Some((pool, store))
}

fn event(event_type: &str) -> Event {
    Event::new(
        EventId::random(),
        EventType::new(event_type),
        EventData::new(r#"{"qty":1}"#),
        EventMetadata::new(),
    )
}

fn correlated(event_type: &str, correlation_id: &str) -> Event {
    Event::new(
        EventId::random(),
        EventType::new(event_type),
        EventData::new("{}"),
        EventMetadata::new().with(EventMetadata::CORRELATION_ID, correlation_id),
    )
}

async fn collect(cursor: &EventStream) -> Vec<EventEnvelope> {
    cursor.envelopes().try_collect().await.unwrap()
}

// =========================================================================
// Commit protocol
// =========================================================================

#[tokio::test]
async fn end_to_end_two_commits_build_one_stream() {
    let Some((_, store)) = test_store("tm_end_to_end").await else {
        return;
    };
    let cart = StreamName::new("cart:1");

    let first = store
        .commit(
            &cart,
            Events::single(event("cart:created")),
            ExpectedVersion::NoStream,
        )
        .await
        .unwrap();
    assert_eq!(first.version.value(), 1);
    assert_eq!(first.sequence_number.value(), 1);

    let second = store
        .commit(
            &cart,
            Events::single(event("cart:item-added")),
            ExpectedVersion::Exact(first.version),
        )
        .await
        .unwrap();
    assert_eq!(second.version.value(), 2);
    assert_eq!(second.sequence_number.value(), 2);

    let cursor = store.load(&cart);
    let envelopes = collect(&cursor).await;
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].event.event_type.as_str(), "cart:created");
    assert_eq!(envelopes[0].version.value(), 1);
    assert_eq!(envelopes[1].event.event_type.as_str(), "cart:item-added");
    assert_eq!(envelopes[1].version.value(), 2);
}

#[tokio::test]
async fn batch_commit_is_atomic_and_shares_one_timestamp() {
    let Some((_, store)) = test_store("tm_batch").await else {
        return;
    };
    let stream = StreamName::new("order:7");
    let batch = Events::from_vec(vec![
        event("order:placed"),
        event("order:paid"),
        event("order:shipped"),
    ])
    .unwrap();

    let result = store
        .commit(&stream, batch, ExpectedVersion::NoStream)
        .await
        .unwrap();
    assert_eq!(result.version.value(), 3);
    assert_eq!(result.sequence_number.value(), 3);

    let cursor = store.load(&stream);
    let envelopes = collect(&cursor).await;
    assert_eq!(
        envelopes.iter().map(|e| e.version.value()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(envelopes.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
    // One commit timestamp for the whole batch.
    assert_eq!(envelopes[0].recorded_at, envelopes[1].recorded_at);
    assert_eq!(envelopes[1].recorded_at, envelopes[2].recorded_at);
}

#[tokio::test]
async fn streams_version_independently() {
    let Some((_, store)) = test_store("tm_independent").await else {
        return;
    };
    let a = StreamName::new("cart:a");
    let b = StreamName::new("cart:b");

    for _ in 0..3 {
        store
            .commit(&a, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
        store
            .commit(&b, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
    }

    let cursor = store.load(&a);
    let envelopes = collect(&cursor).await;
    assert_eq!(
        envelopes.iter().map(|e| e.version.value()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(envelopes.iter().all(|e| e.stream_name == a));
}

#[tokio::test]
async fn no_stream_precondition_rejects_an_existing_stream() {
    let Some((_, store)) = test_store("tm_no_stream").await else {
        return;
    };
    let stream = StreamName::new("cart:dup");

    store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap();
    let err = store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::VersionMismatch { .. }));
}

#[tokio::test]
async fn exact_precondition_rejects_a_stale_version() {
    let Some((_, store)) = test_store("tm_exact").await else {
        return;
    };
    let stream = StreamName::new("cart:stale");

    store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap();
    store
        .commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::Exact(1.into()),
        )
        .await
        .unwrap();

    // The stream moved on to version 2; expecting 1 again must fail.
    let err = store
        .commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::Exact(1.into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::VersionMismatch { .. }));
}

#[tokio::test]
async fn stream_exists_requires_at_least_one_event() {
    let Some((_, store)) = test_store("tm_exists").await else {
        return;
    };
    let stream = StreamName::new("cart:missing");

    let err = store
        .commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::StreamExists,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::VersionMismatch { .. }));

    store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap();
    store
        .commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::StreamExists,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_event_id_exhausts_the_retry_budget() {
    let Some((_, store)) = test_store("tm_dup_id").await else {
        return;
    };
    let duplicated = event("cart:created");

    store
        .commit(
            &StreamName::new("cart:x"),
            Events::single(duplicated.clone()),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();

    // The same event id on another stream violates the id constraint on
    // every attempt; the retry budget runs out.
    let err = store
        .commit(
            &StreamName::new("cart:y"),
            Events::single(duplicated),
            ExpectedVersion::Any,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Concurrency { attempts: 8 }));
}

#[tokio::test]
async fn concurrent_unchecked_commits_both_land() {
    let Some((_, store)) = test_store("tm_race_any").await else {
        return;
    };
    let stream = StreamName::new("cart:race");

    let (left, right) = tokio::join!(
        store.commit(&stream, Events::single(event("cart:item-added")), ExpectedVersion::Any),
        store.commit(&stream, Events::single(event("cart:item-added")), ExpectedVersion::Any),
    );
    let mut versions = vec![left.unwrap().version.value(), right.unwrap().version.value()];
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn racing_exact_commits_allow_exactly_one_winner() {
    let Some((_, store)) = test_store("tm_race_exact").await else {
        return;
    };
    let stream = StreamName::new("cart:contended");
    store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap();

    let (left, right) = tokio::join!(
        store.commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::Exact(1.into()),
        ),
        store.commit(
            &stream,
            Events::single(event("cart:item-added")),
            ExpectedVersion::Exact(1.into()),
        ),
    );

    let outcomes = [left, right];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    let loser = outcomes.into_iter().find(Result::is_err).unwrap().unwrap_err();
    assert!(matches!(
        loser,
        EventStoreError::VersionMismatch { .. } | EventStoreError::Concurrency { .. }
    ));
}

// =========================================================================
// Read protocol
// =========================================================================

#[tokio::test]
async fn empty_stream_reads_empty() {
    let Some((_, store)) = test_store("tm_empty").await else {
        return;
    };
    let cursor = store.load(&StreamName::new("cart:nobody"));
    assert!(collect(&cursor).await.is_empty());
}

#[tokio::test]
async fn category_prefix_is_exact_at_the_boundary() {
    let Some((_, store)) = test_store("tm_category").await else {
        return;
    };
    for stream in ["orders:1", "order:9", "orders", "orders:2"] {
        store
            .commit(
                &StreamName::new(stream),
                Events::single(event("order:placed")),
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
    }

    let cursor = store.load(StreamSelector::category("orders:"));
    let envelopes = collect(&cursor).await;
    let mut streams: Vec<&str> = envelopes.iter().map(|e| e.stream_name.as_str()).collect();
    streams.sort_unstable();
    assert_eq!(streams, vec!["orders:1", "orders:2"]);
}

#[tokio::test]
async fn correlation_reads_span_streams() {
    let Some((_, store)) = test_store("tm_correlation").await else {
        return;
    };
    store
        .commit(
            &StreamName::new("order:1"),
            Events::single(correlated("order:placed", "corr-a")),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();
    store
        .commit(
            &StreamName::new("billing:1"),
            Events::single(correlated("invoice:raised", "corr-a")),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();
    store
        .commit(
            &StreamName::new("order:2"),
            Events::single(correlated("order:placed", "corr-b")),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();

    let cursor = store.load(StreamSelector::correlation("corr-a"));
    let envelopes = collect(&cursor).await;
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes
        .iter()
        .all(|e| e.event.metadata.get_str(EventMetadata::CORRELATION_ID) == Some("corr-a")));
}

#[tokio::test]
async fn backwards_iteration_reverses_forward_order() {
    let Some((_, store)) = test_store("tm_backwards").await else {
        return;
    };
    let stream = StreamName::new("cart:rewind");
    for _ in 0..5 {
        store
            .commit(&stream, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
    }

    let forward_cursor = store.load(&stream);
    let forward = collect(&forward_cursor).await;
    let backward_cursor = store.load(&stream).backwards();
    let backward = collect(&backward_cursor).await;

    assert!(backward
        .windows(2)
        .all(|w| w[0].sequence_number > w[1].sequence_number));
    let mut reversed = forward;
    reversed.reverse();
    assert_eq!(backward, reversed);
}

#[tokio::test]
async fn sequence_bounds_and_limit_compose() {
    let Some((_, store)) = test_store("tm_bounds").await else {
        return;
    };
    let stream = StreamName::new("cart:bounded");
    for _ in 0..6 {
        store
            .commit(&stream, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
    }

    let cursor = store
        .load(StreamSelector::All)
        .with_minimum_sequence_number(SequenceNumber::from(2))
        .with_maximum_sequence_number(SequenceNumber::from(5))
        .limit(2);
    let seqs: Vec<i64> = collect(&cursor)
        .await
        .iter()
        .map(|e| e.sequence_number.value())
        .collect();
    assert_eq!(seqs, vec![2, 3]);

    let cursor = cursor.backwards();
    let seqs: Vec<i64> = collect(&cursor)
        .await
        .iter()
        .map(|e| e.sequence_number.value())
        .collect();
    assert_eq!(seqs, vec![5, 4]);
}

#[tokio::test]
async fn paging_through_large_batches_is_invisible() {
    let Some((_, store)) = test_store("tm_paging").await else {
        return;
    };
    let stream = StreamName::new("import:bulk");
    let batch =
        Events::from_vec((0..120).map(|_| event("import:row-loaded")).collect()).unwrap();
    store
        .commit(&stream, batch, ExpectedVersion::NoStream)
        .await
        .unwrap();

    // 120 rows crosses the internal fetch batch; the consumer still sees one
    // continuous ascending sequence.
    let cursor = store.load(&stream);
    let envelopes = collect(&cursor).await;
    assert_eq!(envelopes.len(), 120);
    assert_eq!(
        envelopes.iter().map(|e| e.version.value()).collect::<Vec<_>>(),
        (1..=120).collect::<Vec<i64>>()
    );
}

#[tokio::test]
async fn reiterating_a_cursor_runs_a_fresh_query() {
    let Some((_, store)) = test_store("tm_reiterate").await else {
        return;
    };
    let stream = StreamName::new("cart:replay");
    store
        .commit(&stream, Events::single(event("cart:created")), ExpectedVersion::NoStream)
        .await
        .unwrap();

    let cursor = store.load(&stream);
    assert_eq!(collect(&cursor).await.len(), 1);

    store
        .commit(&stream, Events::single(event("cart:item-added")), ExpectedVersion::Any)
        .await
        .unwrap();

    // Same cursor object, new pass: the second commit is visible.
    assert_eq!(collect(&cursor).await.len(), 2);
}

#[tokio::test]
async fn corrupt_metadata_fails_the_iteration_with_the_event_id() {
    let Some((pool, store)) = test_store("tm_corrupt").await else {
        return;
    };
    let stream = StreamName::new("cart:damaged");
    let bad = event("cart:created");
    let bad_id = bad.id.clone();
    store
        .commit(&stream, Events::single(bad), ExpectedVersion::NoStream)
        .await
        .unwrap();

    sqlx::query("UPDATE tm_corrupt SET metadata = 'not json' WHERE event_id = $1")
        .bind(bad_id.as_str())
        .execute(&pool)
        .await
        .unwrap();

    let cursor = store.load(&stream);
    let err = cursor
        .envelopes()
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    match err {
        EventStoreError::CorruptRecord { event_id, .. } => {
            assert_eq!(event_id, bad_id.as_str());
        }
        other => panic!("expected CorruptRecord, got {other:?}"),
    }
}

// =========================================================================
// Deletion, setup, status
// =========================================================================

#[tokio::test]
async fn deleting_a_stream_leaves_the_rest_of_the_log_alone() {
    let Some((_, store)) = test_store("tm_delete").await else {
        return;
    };
    let doomed = StreamName::new("cart:doomed");
    let survivor = StreamName::new("cart:survivor");

    for _ in 0..2 {
        store
            .commit(&doomed, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
        store
            .commit(&survivor, Events::single(event("cart:item-added")), ExpectedVersion::Any)
            .await
            .unwrap();
    }
    let survivor_cursor = store.load(&survivor);
    let before = collect(&survivor_cursor).await;

    assert_eq!(store.delete_stream(&doomed).await.unwrap(), 2);

    let doomed_cursor = store.load(&doomed);
    assert!(collect(&doomed_cursor).await.is_empty());
    // Untouched: same envelopes, same sequence numbers, same versions.
    assert_eq!(collect(&survivor_cursor).await, before);
}

#[tokio::test]
async fn setup_is_idempotent() {
    let Some((_, store)) = test_store("tm_setup_twice").await else {
        return;
    };
    store.setup().await.unwrap();
    store
        .commit(
            &StreamName::new("cart:after-setup"),
            Events::single(event("cart:created")),
            ExpectedVersion::NoStream,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn status_is_a_known_gap() {
    let Some((_, store)) = test_store("tm_status").await else {
        return;
    };
    assert_eq!(store.status(), Status::Error("not implemented".to_owned()));
}
