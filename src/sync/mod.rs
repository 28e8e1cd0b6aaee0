//! Source/target seams and the batch executor.
//!
//! The executor only talks to the databases through [`SourceReader`] and
//! [`TargetWriter`]; the PostgreSQL implementations live in
//! [`crate::postgres`].

pub mod executor;

#[cfg(test)]
mod test_utils;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConflictPolicy;
use crate::plan::TableSpec;
use crate::Result;

pub use executor::{CancelSignal, ExecutionReport, SyncExecutor, TableState, APPLY_GRACE};

/// One row, column name to value. Numbers keep their exact textual form.
pub type Row = serde_json::Map<String, Value>;

/// A page of rows pulled from the source for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    /// Zero-based batch index within the table.
    pub index: usize,
    /// Number of rows extracted before this batch.
    pub offset: u64,
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&Row> {
        self.rows.last()
    }
}

/// Counts for one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Read side of a run.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn count_rows(&self, table: &TableSpec) -> Result<u64>;

    /// Returns up to `limit` rows ordered by primary key, strictly after the
    /// key of `after` when given.
    async fn extract_rows(
        &self,
        table: &TableSpec,
        after: Option<&Row>,
        limit: usize,
    ) -> Result<Vec<Row>>;
}

/// Write side of a run.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Upserts `batch` in one transaction; nothing lands when it fails.
    async fn apply_batch(
        &self,
        table: &TableSpec,
        batch: &RowBatch,
        policy: ConflictPolicy,
    ) -> Result<BatchOutcome>;

    /// Deletes every row of the given tables, in the given order, in one
    /// transaction.
    async fn clear_tables(&self, tables: &[&TableSpec]) -> Result<u64>;
}

/// Discovers table definitions from a live schema.
///
/// Tables come back in creation order; a table without a primary key is
/// returned with an empty `primary_key`.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn discover_tables(&self, schema: &str) -> Result<Vec<TableSpec>>;
}

static NULL: Value = Value::Null;

/// Values of the primary-key columns of `row`, in key order.
pub fn key_of<'a>(table: &TableSpec, row: &'a Row) -> Vec<&'a Value> {
    table
        .primary_key
        .iter()
        .map(|col| row.get(col).unwrap_or(&NULL))
        .collect()
}
