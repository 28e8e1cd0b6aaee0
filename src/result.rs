//! Per-table and per-run outcomes.
//!
//! [`aggregate`] folds the executor's ordered [`TableResult`]s into one
//! [`SyncResult`]. The serialized shape of [`SyncResult`] is consumed by
//! tooling, so field names are part of the public contract.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Terminal state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Where and why a table stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableError {
    /// Zero-based index of the failing batch.
    pub batch: usize,
    /// Row offset of the failing batch's first row.
    pub offset: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableResult {
    pub table: String,
    pub status: TableStatus,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// Batches committed to the target.
    pub batches: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TableError>,
}

impl TableResult {
    /// True when every extracted row landed (inserted, updated or unchanged).
    pub fn is_clean(&self) -> bool {
        self.status == TableStatus::Completed && self.failed == 0 && self.error.is_none()
    }

    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failure,
    Cancelled,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial-failure",
            SyncStatus::Failure => "failure",
            SyncStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: SyncStatus,
    /// Table names in plan order.
    pub plan: Vec<String>,
    /// Keyed by table name, serialized in plan order.
    #[serde(with = "tables_by_name")]
    pub tables: Vec<TableResult>,
    pub totals: Totals,
    /// Set only when the run aborted before copying anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    /// Report for a run that ended on a fatal error.
    pub fn aborted(started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: &crate::Error) -> Self {
        SyncResult {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            status: SyncStatus::Failure,
            plan: Vec::new(),
            tables: Vec::new(),
            totals: Totals::default(),
            error: Some(error.to_string()),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableResult> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| !t.is_clean() && t.status != TableStatus::Cancelled)
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Builds the run-level outcome. No I/O.
///
/// `plan` is the full plan; tables never reached (after cancellation) appear
/// in `plan` but not in `tables`.
pub fn aggregate(
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    plan: Vec<String>,
    results: Vec<TableResult>,
    cancelled: bool,
) -> SyncResult {
    let clean = results.iter().filter(|r| r.is_clean()).count();

    let status = if cancelled {
        SyncStatus::Cancelled
    } else if clean == results.len() {
        SyncStatus::Success
    } else if clean > 0 {
        SyncStatus::PartialFailure
    } else {
        SyncStatus::Failure
    };

    let totals = results.iter().fold(Totals::default(), |acc, r| Totals {
        inserted: acc.inserted + r.inserted,
        updated: acc.updated + r.updated,
        unchanged: acc.unchanged + r.unchanged,
        failed: acc.failed + r.failed,
    });

    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

    SyncResult {
        started_at,
        finished_at,
        duration_ms,
        status,
        plan,
        tables: results,
        totals,
        error: None,
    }
}

mod tables_by_name {
    use super::*;

    pub fn serialize<S>(tables: &[TableResult], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(tables.len()))?;
        for table in tables {
            map.serialize_entry(&table.table, table)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<TableResult>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TablesVisitor;

        impl<'de> Visitor<'de> for TablesVisitor {
            type Value = Vec<TableResult>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of table name to table result")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tables = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, mut result)) = access.next_entry::<String, TableResult>()? {
                    result.table = name;
                    tables.push(result);
                }
                Ok(tables)
            }
        }

        deserializer.deserialize_map(TablesVisitor)
    }
}
