//! CheckpointStore — a subscriber's persisted cursor over the global log.
//!
//! The row lock taken during acquisition is deliberately short-lived: it
//! serializes concurrent acquirers for the read-and-decide instant and is
//! released (rolled back) before the call returns. The acquire/release pair
//! brackets the subscriber's processing window by convention only; storage
//! does not enforce exclusion across the whole window.

use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::PgPool;
use thiserror::Error;
use tidemark_events::{SequenceNumber, SetupResult};

/// Postgres SQLSTATE for `lock_not_available`, raised by FOR UPDATE NOWAIT
/// when another transaction holds the row.
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// This instance is already inside an acquire/release window. Lock
    /// nesting is a caller bug, not a condition to wait out.
    #[error("checkpoint lock for subscriber \"{0}\" is already held by this instance")]
    LockAlreadyHeld(String),

    /// Another process holds the row lock right now. Never waited on; the
    /// caller backs off at the application level.
    #[error("checkpoint lock for subscriber \"{0}\" is held by another process")]
    LockUnavailable(String),

    /// The subscriber's checkpoint row does not exist. Setup was not run;
    /// this is a configuration error, not a runtime condition.
    #[error("no checkpoint row for subscriber \"{0}\", run setup() first")]
    MissingRow(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Per-subscriber checkpoint coordination. Exactly one catch-up process per
/// subscriber id is supposed to run at a time; this store makes the
/// violation detectable, not impossible.
pub struct CheckpointStore {
    pool: PgPool,
    table: String,
    subscriber_id: String,
    window_open: AtomicBool,
}

impl CheckpointStore {
    pub fn new(pool: PgPool, table: impl Into<String>, subscriber_id: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            subscriber_id: subscriber_id.into(),
            window_open: AtomicBool::new(false),
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Open a processing window and return the last applied sequence number.
    ///
    /// Fails fast with [`CheckpointError::LockAlreadyHeld`] if this instance
    /// never released its previous window, and with
    /// [`CheckpointError::LockUnavailable`] if another process is acquiring
    /// at this instant. The underlying row lock is rolled back before
    /// returning.
    pub async fn acquire_lock(&self) -> Result<SequenceNumber, CheckpointError> {
        if self.window_open.swap(true, Ordering::SeqCst) {
            return Err(CheckpointError::LockAlreadyHeld(self.subscriber_id.clone()));
        }
        match self.read_locked().await {
            Ok(sequence_number) => Ok(sequence_number),
            Err(err) => {
                self.window_open.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn read_locked(&self) -> Result<SequenceNumber, CheckpointError> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "SELECT applied_sequence_number FROM {} WHERE subscriber_id = $1 FOR UPDATE NOWAIT",
            self.table
        );
        let applied: Option<i64> = sqlx::query_scalar(&query)
            .bind(&self.subscriber_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| self.classify(err))?;
        tx.rollback().await?;
        applied
            .map(SequenceNumber::from)
            .ok_or_else(|| CheckpointError::MissingRow(self.subscriber_id.clone()))
    }

    fn classify(&self, err: sqlx::Error) -> CheckpointError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
                return CheckpointError::LockUnavailable(self.subscriber_id.clone());
            }
        }
        CheckpointError::Storage(err)
    }

    /// Persist the new highest applied sequence number and close the window.
    pub async fn update_and_release_lock(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let query = format!(
            "UPDATE {} SET applied_sequence_number = $1 WHERE subscriber_id = $2",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(sequence_number.value())
            .bind(&self.subscriber_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CheckpointError::MissingRow(self.subscriber_id.clone()));
        }
        self.window_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Read-only view of the checkpoint, for inspection and monitoring.
    pub async fn highest_applied_sequence_number(
        &self,
    ) -> Result<SequenceNumber, CheckpointError> {
        let query = format!(
            "SELECT applied_sequence_number FROM {} WHERE subscriber_id = $1",
            self.table
        );
        let applied: Option<i64> = sqlx::query_scalar(&query)
            .bind(&self.subscriber_id)
            .fetch_optional(&self.pool)
            .await?;
        applied
            .map(SequenceNumber::from)
            .ok_or_else(|| CheckpointError::MissingRow(self.subscriber_id.clone()))
    }

    /// Idempotently create the checkpoint table and seed this subscriber's
    /// row at zero. An already-seeded row is left untouched.
    pub async fn setup(&self) -> Result<SetupResult, CheckpointError> {
        let table = &self.table;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                subscriber_id           VARCHAR(255) PRIMARY KEY,
                applied_sequence_number BIGINT       NOT NULL
            )
            "#
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        let seed = format!(
            "INSERT INTO {table} (subscriber_id, applied_sequence_number) VALUES ($1, 0) \
             ON CONFLICT (subscriber_id) DO NOTHING"
        );
        sqlx::query(&seed)
            .bind(&self.subscriber_id)
            .execute(&self.pool)
            .await?;
        Ok(SetupResult {
            message: format!(
                "checkpoint table \"{table}\" is ready for subscriber \"{}\"",
                self.subscriber_id
            ),
        })
    }
}
