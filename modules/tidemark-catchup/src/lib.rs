//! Catch-up coordination for Tidemark subscribers: per-subscriber
//! checkpoints with fail-fast lock acquisition, and a driver that brackets
//! the read-apply loop between acquire and release.

pub mod checkpoint;
pub mod driver;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use driver::{catch_up, CatchUpError};
