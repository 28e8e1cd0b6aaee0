use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::connection::{ConnectionPool, PooledConnection};
use super::{describe, sql};
use crate::config::{ConflictPolicy, IsolationLevel};
use crate::plan::TableSpec;
use crate::sync::{BatchOutcome, RowBatch, TargetWriter};
use crate::{Error, Result};

/// Write access to the local database.
pub struct PgTarget {
    pool: ConnectionPool,
    schema: String,
    isolation: IsolationLevel,
    statement_timeout: Duration,
}

impl PgTarget {
    /// `statement_timeout` bounds every statement of a batch on the server,
    /// so a slow batch is rolled back rather than abandoned mid-commit.
    pub fn new(
        pool: ConnectionPool,
        schema: impl Into<String>,
        isolation: IsolationLevel,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            schema: schema.into(),
            isolation,
            statement_timeout,
        }
    }

    async fn upsert(
        &self,
        conn: &mut PooledConnection,
        table: &TableSpec,
        statement: &str,
        payload: &str,
    ) -> Result<(u64, u64)> {
        let tx = conn
            .build_transaction()
            .isolation_level(self.isolation.into())
            .start()
            .await?;

        tx.batch_execute(&sql::batch_timeouts(self.statement_timeout))
            .await?;
        tx.batch_execute(&sql::lock_table(&self.schema, &table.name))
            .await?;
        let returned = tx.query(statement, &[&payload]).await?;
        tx.commit().await?;

        let mut inserted = 0;
        let mut updated = 0;
        for row in &returned {
            if row.try_get::<_, bool>(0)? {
                inserted += 1;
            } else {
                updated += 1;
            }
        }
        Ok((inserted, updated))
    }
}

#[async_trait]
impl TargetWriter for PgTarget {
    async fn apply_batch(
        &self,
        table: &TableSpec,
        batch: &RowBatch,
        policy: ConflictPolicy,
    ) -> Result<BatchOutcome> {
        let columns: Vec<String> = match batch.rows.first() {
            Some(row) => row.keys().cloned().collect(),
            None => return Ok(BatchOutcome::default()),
        };

        let statement = sql::upsert_rows(&self.schema, table, &columns, policy);
        let payload = serde_json::to_string(&batch.rows)?;
        debug!(table = %table.name, batch = batch.index, bytes = payload.len(), "Applying batch");

        let mut conn = self.pool.acquire().await?;
        let (inserted, updated) = self
            .upsert(&mut conn, table, &statement, &payload)
            .await
            .map_err(|e| Error::BatchApply {
                table: table.name.clone(),
                batch: batch.index,
                offset: batch.offset,
                message: describe(&e),
            })?;
        conn.release();

        let written = inserted + updated;
        Ok(BatchOutcome {
            inserted,
            updated,
            unchanged: (batch.len() as u64).saturating_sub(written),
        })
    }

    async fn clear_tables(&self, tables: &[&TableSpec]) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(self.isolation.into())
            .start()
            .await?;

        let mut deleted = 0;
        for table in tables {
            let rows = tx
                .execute(&sql::delete_all(&self.schema, &table.name), &[])
                .await
                .map_err(|e| Error::Cleanup {
                    message: format!("{}: {}", table.name, describe(&Error::Postgres(e))),
                })?;
            info!(table = %table.name, rows, "Cleared target table");
            deleted += rows;
        }

        tx.commit().await?;
        conn.release();
        Ok(deleted)
    }
}
