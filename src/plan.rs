//! Dependency-ordered table plans.
//!
//! A [`SyncPlan`] lists tables so that every table comes after the tables its
//! foreign keys reference. Ties are broken by declaration order, which makes
//! the plan deterministic for a given input.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::{Error, Result};

/// A table to synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Primary-key columns in key order.
    pub primary_key: Vec<String>,
    /// Tables referenced by this table's foreign keys.
    #[serde(default)]
    pub references: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            references: Vec::new(),
        }
    }

    pub fn references(mut self, parent: impl Into<String>) -> Self {
        self.references.push(parent.into());
        self
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.primary_key.iter().any(|k| k == column)
    }
}

/// Immutable copy order for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    tables: Vec<TableSpec>,
}

impl SyncPlan {
    /// Tables in copy order (parents first).
    pub fn copy_order(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Tables in cleanup order (children first).
    pub fn cleanup_order(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter().rev()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Orders `tables` so that parents precede children.
///
/// References to tables outside the set are ignored; they are assumed to be
/// present in the target already. A cycle (including a table referencing
/// itself) fails with [`Error::CyclicDependency`].
pub fn build_plan(tables: Vec<TableSpec>) -> Result<SyncPlan> {
    let mut position = HashMap::with_capacity(tables.len());
    for (idx, table) in tables.iter().enumerate() {
        if position.insert(table.name.as_str(), idx).is_some() {
            return Err(Error::Config(format!(
                "table '{}' is declared more than once",
                table.name
            )));
        }
        if table.primary_key.is_empty() {
            return Err(Error::Schema {
                table: table.name.clone(),
                message: "table has no primary key".to_string(),
            });
        }
    }

    // parents[i] = in-set tables that table i depends on
    let parents: Vec<HashSet<usize>> = tables
        .iter()
        .map(|t| {
            t.references
                .iter()
                .filter_map(|parent| position.get(parent.as_str()).copied())
                .collect()
        })
        .collect();

    let mut placed = vec![false; tables.len()];
    let mut order = Vec::with_capacity(tables.len());

    while order.len() < tables.len() {
        let ready = (0..tables.len())
            .find(|&i| !placed[i] && parents[i].iter().all(|&p| placed[p]));

        match ready {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let stuck = (0..tables.len())
                    .filter(|&i| !placed[i])
                    .map(|i| tables[i].name.clone())
                    .collect();
                return Err(Error::CyclicDependency { tables: stuck });
            }
        }
    }

    let mut slots: Vec<Option<TableSpec>> = tables.into_iter().map(Some).collect();
    let tables: Vec<TableSpec> = order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();

    debug!(
        order = ?tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "Built sync plan"
    );

    Ok(SyncPlan { tables })
}
