//! SQLite storage for sync bookkeeping
//!
//! Provides the persisted key-value progress store used by the sync engine
//! (download, enhance and UTXO markers), with WAL mode, schema migrations and
//! automatic retry on SQLITE_BUSY.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod busy;
pub mod database;
pub mod error;
pub mod migrations;
pub mod progress_store;

pub use busy::{calculate_backoff, is_busy_error, with_busy_retry, BASE_BACKOFF_MS, MAX_BACKOFF_MS, MAX_BUSY_RETRIES};
pub use database::Database;
pub use error::{Error, Result};
pub use progress_store::{ProgressEntry, ProgressStore};
