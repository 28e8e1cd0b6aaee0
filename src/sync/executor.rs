use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{BatchOutcome, Row, RowBatch, SourceReader, TargetWriter};
use crate::config::ConflictPolicy;
use crate::plan::{SyncPlan, TableSpec};
use crate::result::{TableError, TableResult, TableStatus};
use crate::{Error, Result};

/// Extra client-side time an apply gets beyond the call timeout, so a
/// writer enforcing the call timeout server-side fails and rolls back first.
pub const APPLY_GRACE: Duration = Duration::from_secs(5);

/// External stop request. Checked before every batch.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

/// Lifecycle of one table within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Pending,
    Extracting,
    Applying,
    Completed,
    Failed,
    Cancelled,
}

impl TableState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TableState::Completed | TableState::Failed | TableState::Cancelled
        )
    }
}

/// What the executor produced before stopping.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// One entry per table attempted, in plan order.
    pub results: Vec<TableResult>,
    pub cancelled: bool,
}

/// Copies tables one at a time in plan order.
pub struct SyncExecutor<'a> {
    source: &'a dyn SourceReader,
    target: &'a dyn TargetWriter,
    batch_size: usize,
    call_timeout: Duration,
    policy: ConflictPolicy,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(
        source: &'a dyn SourceReader,
        target: &'a dyn TargetWriter,
        batch_size: usize,
        call_timeout: Duration,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            source,
            target,
            batch_size: batch_size.max(1),
            call_timeout,
            policy,
        }
    }

    /// Runs the whole plan. Table failures are recorded, never raised.
    pub async fn run(&self, plan: &SyncPlan, cancel: &CancelSignal) -> ExecutionReport {
        let mut results = Vec::with_capacity(plan.len());
        let mut cancelled = false;

        for table in plan.copy_order() {
            if cancel.is_cancelled() {
                info!(table = %table.name, "Cancellation requested, not starting table");
                cancelled = true;
                break;
            }

            let result = self.sync_table(table, cancel).await;
            let stop = result.status == TableStatus::Cancelled;
            results.push(result);

            if stop {
                cancelled = true;
                break;
            }
        }

        ExecutionReport { results, cancelled }
    }

    /// Empties every planned table on the target, children first.
    pub async fn clean_target(&self, plan: &SyncPlan) -> Result<u64> {
        let tables: Vec<&TableSpec> = plan.cleanup_order().collect();
        info!(tables = tables.len(), "Cleaning target tables before copy");

        let deleted = self
            .call("clean target tables", self.target.clear_tables(&tables))
            .await
            .map_err(|e| match e {
                Error::Cleanup { .. } => e,
                other => Error::Cleanup {
                    message: other.to_string(),
                },
            })?;

        info!(rows = deleted, "Target tables cleaned");
        Ok(deleted)
    }

    async fn sync_table(&self, table: &TableSpec, cancel: &CancelSignal) -> TableResult {
        let mut progress = TableProgress::new(table);
        info!(table = %table.name, "Synchronizing table");

        progress.transition(TableState::Extracting);
        let total = match self
            .call(&format!("count rows of {}", table.name), self.source.count_rows(table))
            .await
        {
            Ok(total) => total,
            Err(e) => return progress.fail(0, 0, 0, 0, e),
        };
        debug!(table = %table.name, rows = total, "Source row count");

        let mut batch = match self.extract(table, None, 0, 0).await {
            Ok(batch) => batch,
            Err(e) => return progress.fail(0, 0, 0, total, e),
        };

        while !batch.is_empty() {
            if cancel.is_cancelled() {
                return progress.cancel();
            }

            progress.transition(TableState::Applying);
            let has_more = batch.len() >= self.batch_size;
            let next_index = batch.index + 1;
            let next_offset = batch.offset + batch.len() as u64;

            // Pull the next page while this one is being written.
            let (applied, next) = if has_more {
                let (applied, next) = tokio::join!(
                    self.apply(table, &batch),
                    self.extract(table, batch.last(), next_index, next_offset)
                );
                (applied, Some(next))
            } else {
                (self.apply(table, &batch).await, None)
            };

            match applied {
                Ok(outcome) => progress.record(&batch, outcome),
                Err(e) => {
                    return progress.fail(batch.index, batch.offset, batch.len() as u64, total, e)
                }
            }

            match next {
                None => break,
                Some(Ok(next_batch)) => {
                    progress.transition(TableState::Extracting);
                    batch = next_batch;
                }
                Some(Err(e)) => return progress.fail(next_index, next_offset, 0, total, e),
            }
        }

        progress.complete()
    }

    async fn extract(
        &self,
        table: &TableSpec,
        after: Option<&Row>,
        index: usize,
        offset: u64,
    ) -> Result<RowBatch> {
        let rows = self
            .call(
                &format!("extract batch {} of {}", index, table.name),
                self.source.extract_rows(table, after, self.batch_size),
            )
            .await?;

        debug!(table = %table.name, batch = index, offset, rows = rows.len(), "Extracted batch");
        Ok(RowBatch { index, offset, rows })
    }

    async fn apply(&self, table: &TableSpec, batch: &RowBatch) -> Result<BatchOutcome> {
        let outcome = self
            .call_within(
                self.call_timeout + APPLY_GRACE,
                &format!("apply batch {} of {}", batch.index, table.name),
                self.target.apply_batch(table, batch, self.policy),
            )
            .await?;

        debug!(
            table = %table.name,
            batch = batch.index,
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "Applied batch"
        );
        Ok(outcome)
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.call_within(self.call_timeout, what, fut).await
    }

    async fn call_within<T, F>(&self, limit: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                message: format!("{} did not finish within {:?}", what, limit),
            }),
        }
    }
}

/// Mutable bookkeeping for the table currently being synchronized.
struct TableProgress<'t> {
    table: &'t TableSpec,
    state: TableState,
    started: Instant,
    inserted: u64,
    updated: u64,
    unchanged: u64,
    batches: usize,
}

impl<'t> TableProgress<'t> {
    fn new(table: &'t TableSpec) -> Self {
        Self {
            table,
            state: TableState::Pending,
            started: Instant::now(),
            inserted: 0,
            updated: 0,
            unchanged: 0,
            batches: 0,
        }
    }

    fn transition(&mut self, next: TableState) {
        debug_assert!(!self.state.is_terminal(), "table already finished");
        if self.state != next {
            debug!(table = %self.table.name, from = ?self.state, to = ?next, "Table state");
            self.state = next;
        }
    }

    fn record(&mut self, batch: &RowBatch, outcome: BatchOutcome) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.unchanged += outcome.unchanged;
        self.batches += 1;

        let accounted = outcome.inserted + outcome.updated + outcome.unchanged;
        if accounted != batch.len() as u64 {
            warn!(
                table = %self.table.name,
                batch = batch.index,
                rows = batch.len(),
                accounted,
                "Batch outcome does not account for every row"
            );
        }
    }

    fn processed(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }

    fn fail(
        mut self,
        batch: usize,
        offset: u64,
        batch_rows: u64,
        total: u64,
        error: Error,
    ) -> TableResult {
        // The failed batch and everything after it count as failed.
        let failed = total.saturating_sub(self.processed()).max(batch_rows);
        warn!(
            table = %self.table.name,
            batch,
            offset,
            failed,
            error = %error,
            "Table failed, skipping its remaining batches"
        );

        self.transition(TableState::Failed);
        self.finish(
            TableStatus::Failed,
            failed,
            Some(TableError {
                batch,
                offset,
                message: error.to_string(),
            }),
        )
    }

    fn cancel(mut self) -> TableResult {
        info!(table = %self.table.name, batches = self.batches, "Table cancelled");
        self.transition(TableState::Cancelled);
        self.finish(TableStatus::Cancelled, 0, None)
    }

    fn complete(mut self) -> TableResult {
        info!(
            table = %self.table.name,
            inserted = self.inserted,
            updated = self.updated,
            unchanged = self.unchanged,
            batches = self.batches,
            "Table synchronized"
        );
        self.transition(TableState::Completed);
        self.finish(TableStatus::Completed, 0, None)
    }

    fn finish(self, status: TableStatus, failed: u64, error: Option<TableError>) -> TableResult {
        TableResult {
            table: self.table.name.clone(),
            status,
            inserted: self.inserted,
            updated: self.updated,
            unchanged: self.unchanged,
            failed,
            batches: self.batches,
            duration_ms: self.started.elapsed().as_millis() as u64,
            error,
        }
    }
}
