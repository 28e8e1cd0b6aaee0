//! Entry point wiring connections, planning, execution and aggregation.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::plan::{build_plan, SyncPlan, TableSpec};
use crate::postgres::{ConnectionManager, Endpoint, PgSource, PgTarget};
use crate::result::{aggregate, SyncResult};
use crate::sync::{CancelSignal, SchemaCatalog, SyncExecutor};
use crate::{Error, Result};

/// Synchronizes the configured target from production.
///
/// Fatal problems (unreachable endpoint, cyclic foreign keys, unknown
/// tables) are returned as `Err`; table-level failures are reported inside
/// the returned [`SyncResult`].
pub async fn sync_from_production(config: &Config, cancel: CancelSignal) -> Result<SyncResult> {
    SyncEngine::new(config.clone()).run(cancel).await
}

pub struct SyncEngine {
    config: Config,
    declared: Option<Vec<TableSpec>>,
}

impl SyncEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            declared: None,
        }
    }

    /// Uses a fixed table list instead of discovering the source schema.
    pub fn with_tables(mut self, tables: Vec<TableSpec>) -> Self {
        self.declared = Some(tables);
        self
    }

    pub async fn run(&self, cancel: CancelSignal) -> Result<SyncResult> {
        self.config.validate()?;
        let started_at = Utc::now();

        // A declared plan is checked before touching either database.
        let declared_plan = match &self.declared {
            Some(tables) => Some(build_plan(tables.clone())?),
            None => None,
        };

        let mut connections = ConnectionManager::new();
        let outcome = self
            .run_with(&mut connections, declared_plan, started_at, &cancel)
            .await;
        connections.close();

        match &outcome {
            Ok(result) => info!(
                status = %result.status,
                tables = result.tables.len(),
                inserted = result.totals.inserted,
                updated = result.totals.updated,
                unchanged = result.totals.unchanged,
                failed = result.totals.failed,
                duration_ms = result.duration_ms,
                "Sync finished"
            ),
            Err(e) => error!("Sync aborted: {}", e),
        }
        outcome
    }

    async fn run_with(
        &self,
        connections: &mut ConnectionManager,
        declared_plan: Option<SyncPlan>,
        started_at: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> Result<SyncResult> {
        let options = &self.config.sync;

        let source_pool = connections.open(Endpoint::Source, &self.config.source).await?;
        let source = PgSource::begin(&source_pool, options.schema.clone())
            .await
            .map_err(source_unreachable)?;

        let plan = match declared_plan {
            Some(plan) => plan,
            None => {
                let discovered = tokio::time::timeout(
                    self.config.call_timeout(),
                    source.discover_tables(&options.schema),
                )
                .await
                .map_err(|_| Error::connection("source", "schema discovery timed out"))?
                .map_err(source_unreachable)?;
                build_plan(select_tables(discovered, options.tables.as_deref())?)?
            }
        };
        info!(plan = ?plan.table_names(), "Sync plan ready");

        let target_pool = connections.open(Endpoint::Target, &self.config.target).await?;
        let target = PgTarget::new(
            target_pool,
            options.schema.clone(),
            options.isolation,
            self.config.call_timeout(),
        );

        let executor = SyncExecutor::new(
            &source,
            &target,
            options.batch_size,
            self.config.call_timeout(),
            options.conflict_policy,
        );

        if options.clean_target {
            executor.clean_target(&plan).await?;
        }

        let report = executor.run(&plan, cancel).await;
        if let Err(e) = source.finish().await {
            warn!("Failed to close source snapshot: {}", e);
        }

        Ok(aggregate(
            started_at,
            Utc::now(),
            plan.table_names(),
            report.results,
            report.cancelled,
        ))
    }
}

fn source_unreachable(error: Error) -> Error {
    match error {
        Error::Postgres(pg) => Error::connection("source", pg),
        other => other,
    }
}

/// Narrows discovered tables to what the run should copy.
///
/// Without a subset, tables lacking a primary key are skipped with a
/// warning. A subset naming an unknown or keyless table is an error. The
/// subset's order becomes the declaration order.
pub fn select_tables(discovered: Vec<TableSpec>, subset: Option<&[String]>) -> Result<Vec<TableSpec>> {
    match subset {
        None => Ok(discovered
            .into_iter()
            .filter(|t| {
                if t.primary_key.is_empty() {
                    warn!(table = %t.name, "Skipping table without a primary key");
                    false
                } else {
                    true
                }
            })
            .collect()),
        Some(names) => names
            .iter()
            .map(|name| {
                let table = discovered
                    .iter()
                    .find(|t| &t.name == name)
                    .cloned()
                    .ok_or_else(|| Error::Schema {
                        table: name.clone(),
                        message: "table not found in source schema".to_string(),
                    })?;
                if table.primary_key.is_empty() {
                    return Err(Error::Schema {
                        table: name.clone(),
                        message: "table has no primary key".to_string(),
                    });
                }
                Ok(table)
            })
            .collect(),
    }
}
