use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, warn};

use super::connection::{ConnectionPool, PooledConnection};
use super::sql;
use crate::plan::TableSpec;
use crate::sync::{Row, SchemaCatalog, SourceReader};
use crate::{Error, Result};

/// Read-only access to the production database.
///
/// Every read goes through one `REPEATABLE READ READ ONLY` transaction held
/// open from [`begin`](Self::begin) to [`finish`](Self::finish), so the whole
/// run copies a single consistent snapshot of the source.
pub struct PgSource {
    conn: PooledConnection,
    schema: String,
}

impl PgSource {
    /// Checks out a connection and fixes the snapshot all later reads use.
    pub async fn begin(pool: &ConnectionPool, schema: impl Into<String>) -> Result<Self> {
        let conn = pool.acquire().await?;
        // The snapshot is taken by the first statement, not by BEGIN.
        conn.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; SELECT 1")
            .await?;
        info!("Source snapshot taken");

        Ok(Self {
            conn,
            schema: schema.into(),
        })
    }

    /// Ends the snapshot transaction and returns the connection to its pool.
    pub async fn finish(self) -> Result<()> {
        self.conn.batch_execute("COMMIT").await?;
        self.conn.release();
        debug!("Source snapshot released");
        Ok(())
    }

    /// Runs one read under a savepoint so a failed statement does not abort
    /// the shared snapshot transaction.
    async fn read(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        self.conn.batch_execute("SAVEPOINT source_read").await?;
        match self.conn.query(statement, params).await {
            Ok(rows) => {
                self.conn.batch_execute("RELEASE SAVEPOINT source_read").await?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .batch_execute("ROLLBACK TO SAVEPOINT source_read")
                    .await
                {
                    warn!("Failed to roll back source read: {}", rollback);
                }
                Err(e.into())
            }
        }
    }

    fn cursor_for(table: &TableSpec, row: &Row) -> Result<String> {
        let key: Row = table
            .primary_key
            .iter()
            .map(|col| (col.clone(), row.get(col).cloned().unwrap_or(Value::Null)))
            .collect();
        Ok(serde_json::to_string(&key)?)
    }
}

#[async_trait]
impl SourceReader for PgSource {
    async fn count_rows(&self, table: &TableSpec) -> Result<u64> {
        let rows = self
            .read(&sql::count_rows(&self.schema, &table.name), &[])
            .await?;
        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn extract_rows(
        &self,
        table: &TableSpec,
        after: Option<&Row>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let statement = sql::extract_rows(&self.schema, table, after.is_some(), limit);
        let rows = match after {
            Some(last) => {
                let cursor = Self::cursor_for(table, last)?;
                self.read(&statement, &[&cursor]).await?
            }
            None => self.read(&statement, &[]).await?,
        };

        rows.iter()
            .map(|row| {
                let text: String = row.try_get(0)?;
                match serde_json::from_str::<Value>(&text)? {
                    Value::Object(map) => Ok(map),
                    other => Err(Error::Schema {
                        table: table.name.clone(),
                        message: format!("expected a row object, got {}", other),
                    }),
                }
            })
            .collect()
    }
}

#[async_trait]
impl SchemaCatalog for PgSource {
    async fn discover_tables(&self, schema: &str) -> Result<Vec<TableSpec>> {
        info!(schema, "Discovering tables on source");
        let table_rows = self.read(sql::DISCOVER_TABLES, &[&schema]).await?;
        let fk_rows = self.read(sql::DISCOVER_FOREIGN_KEYS, &[&schema]).await?;

        let mut references: HashMap<String, Vec<String>> = HashMap::new();
        for row in &fk_rows {
            let child: String = row.try_get("child_table")?;
            let parent: String = row.try_get("parent_table")?;
            let parents = references.entry(child).or_default();
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in &table_rows {
            let name: String = row.try_get("table_name")?;
            let primary_key: Vec<String> = row.try_get("primary_key")?;
            let references = references.remove(&name).unwrap_or_default();
            debug!(table = %name, ?primary_key, ?references, "Discovered table");
            tables.push(TableSpec {
                name,
                primary_key,
                references,
            });
        }

        info!(schema, tables = tables.len(), "Discovered source tables");
        Ok(tables)
    }
}
