//! Error types and result handling for prod-sync.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into two groups. Fatal errors ([`Error::Connection`],
//! [`Error::CyclicDependency`], [`Error::Schema`], [`Error::Config`] and
//! [`Error::Cleanup`]) end the run and are returned to the caller of
//! [`sync_from_production`](crate::sync_from_production). Batch-level errors
//! ([`Error::BatchApply`], [`Error::Timeout`]) are captured into the affected
//! table's [`TableResult`](crate::TableResult) and the run carries on.
//!
//! # Example
//!
//! ```rust
//! use prod_sync::{Error, Result};
//!
//! fn connect_to_production() -> Result<()> {
//!     Err(Error::Connection {
//!         endpoint: "source".to_string(),
//!         message: "connection refused".to_string(),
//!     })
//! }
//!
//! match connect_to_production() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_fatal() => eprintln!("Aborting run: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for prod-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically a missing or malformed environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding rows or reports.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from report or settings file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cannot reach or authenticate to one of the two databases.
    #[error("Connection error ({endpoint}): {message}")]
    Connection {
        /// Which endpoint failed (`source` or `target`)
        endpoint: String,
        /// Underlying cause
        message: String,
    },

    /// The foreign-key graph among the planned tables has a cycle.
    #[error("Cyclic foreign-key dependency among tables: {}", tables.join(", "))]
    CyclicDependency {
        /// Tables that could not be ordered
        tables: Vec<String>,
    },

    /// A batch failed to commit on the target.
    #[error("Batch {batch} of table '{table}' (row offset {offset}) failed: {message}")]
    BatchApply {
        /// Table being synchronized
        table: String,
        /// Zero-based batch index within the table
        batch: usize,
        /// Row offset of the first row in the batch
        offset: u64,
        /// Underlying cause
        message: String,
    },

    /// A table cannot be synchronized as declared (unknown, or no primary key).
    #[error("Schema error for table '{table}': {message}")]
    Schema {
        /// Offending table
        table: String,
        /// Description of the problem
        message: String,
    },

    /// Pre-copy cleanup of the target failed before anything was copied.
    #[error("Target cleanup failed: {message}")]
    Cleanup {
        /// Underlying cause
        message: String,
    },

    /// A network call did not complete within the configured timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Bearer token could not be issued.
    #[error("Token error: {0}")]
    Token(String),
}

impl Error {
    /// Returns `true` for errors that abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Connection { .. }
                | Error::CyclicDependency { .. }
                | Error::Schema { .. }
                | Error::Cleanup { .. }
        )
    }

    /// Wraps any error as a connection failure for the given endpoint.
    pub(crate) fn connection(endpoint: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            message: cause.to_string(),
        }
    }
}

/// A convenient Result type alias for prod-sync operations.
///
/// This is equivalent to `std::result::Result<T, prod_sync::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
