use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use super::{key_of, BatchOutcome, Row, RowBatch, SchemaCatalog, SourceReader, TargetWriter};
use crate::config::ConflictPolicy;
use crate::plan::TableSpec;
use crate::{Error, Result};

/// In-memory stand-in for a PostgreSQL database.
///
/// Batches are applied to a working copy that replaces the table only when
/// every row succeeded, so a failed batch leaves nothing behind. Foreign keys
/// are checked against the same database.
pub struct MemoryDatabase {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    tables: Vec<MemTable>,
    failures: Vec<InjectedFailure>,
    apply_delay: Option<Duration>,
    extract_failure: Option<(String, usize)>,
    cancel_after: Option<(usize, watch::Sender<bool>)>,
    applies: usize,
    extracts: usize,
}

#[derive(Clone)]
struct MemTable {
    spec: TableSpec,
    columns: Vec<String>,
    foreign_keys: Vec<(String, String)>,
    rows: Vec<Row>,
}

struct InjectedFailure {
    table: String,
    column: String,
    value: Value,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn create_table(&self, name: &str, primary_key: &[&str], columns: &[&str]) -> &Self {
        self.state.lock().unwrap().tables.push(MemTable {
            spec: TableSpec::new(name, primary_key),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            foreign_keys: Vec::new(),
            rows: Vec::new(),
        });
        self
    }

    pub fn foreign_key(&self, table: &str, column: &str, parent: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        let mem = state.table_mut(table).expect("unknown table");
        mem.foreign_keys.push((column.to_string(), parent.to_string()));
        mem.spec.references.push(parent.to_string());
        self
    }

    /// Seeds a row without any checks.
    pub fn insert(&self, table: &str, row: Value) -> &Self {
        let row = match row {
            Value::Object(map) => map,
            other => panic!("rows must be objects, got {}", other),
        };
        let mut state = self.state.lock().unwrap();
        let mem = state.table_mut(table).expect("unknown table");
        mem.rows.push(row);
        let spec = mem.spec.clone();
        mem.rows.sort_by(|a, b| compare_keys(&key_of(&spec, a), &key_of(&spec, b)));
        self
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        let mut state = self.state.lock().unwrap();
        state
            .table_mut(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn spec(&self, table: &str) -> TableSpec {
        let mut state = self.state.lock().unwrap();
        state.table_mut(table).expect("unknown table").spec.clone()
    }

    /// Any batch for `table` containing `column = value` fails.
    pub fn fail_on(&self, table: &str, column: &str, value: Value) -> &Self {
        self.state.lock().unwrap().failures.push(InjectedFailure {
            table: table.to_string(),
            column: column.to_string(),
            value,
        });
        self
    }

    /// The `nth` extraction (zero-based) of `table` fails.
    pub fn fail_extract(&self, table: &str, nth: usize) -> &Self {
        self.state.lock().unwrap().extract_failure = Some((table.to_string(), nth));
        self
    }

    pub fn delay_applies(&self, delay: Duration) -> &Self {
        self.state.lock().unwrap().apply_delay = Some(delay);
        self
    }

    /// Fires `sender` once `applies` batches have committed.
    pub fn cancel_after_applies(&self, applies: usize, sender: watch::Sender<bool>) -> &Self {
        self.state.lock().unwrap().cancel_after = Some((applies, sender));
        self
    }

    pub fn apply_count(&self) -> usize {
        self.state.lock().unwrap().applies
    }
}

impl State {
    fn table_mut(&mut self, name: &str) -> Option<&mut MemTable> {
        self.tables.iter_mut().find(|t| t.spec.name == name)
    }

    fn table(&self, name: &str) -> Option<&MemTable> {
        self.tables.iter().find(|t| t.spec.name == name)
    }

    fn has_key(&self, table: &str, value: &Value) -> bool {
        self.table(table)
            .map(|t| {
                t.rows
                    .iter()
                    .any(|r| compare_keys(&key_of(&t.spec, r), &[value]) == Ordering::Equal)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl SourceReader for MemoryDatabase {
    async fn count_rows(&self, table: &TableSpec) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.table(&table.name).map(|t| t.rows.len() as u64).unwrap_or(0))
    }

    async fn extract_rows(
        &self,
        table: &TableSpec,
        after: Option<&Row>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let mut state = self.state.lock().unwrap();
        let nth = state.extracts;
        state.extracts += 1;

        if let Some((name, fail_at)) = &state.extract_failure {
            if name == &table.name && *fail_at == nth {
                return Err(Error::Timeout {
                    message: "source stopped responding".to_string(),
                });
            }
        }

        let mem = state.table(&table.name).ok_or_else(|| Error::Schema {
            table: table.name.clone(),
            message: "relation does not exist".to_string(),
        })?;

        let after_key = after.map(|row| key_of(table, row));
        Ok(mem
            .rows
            .iter()
            .filter(|row| match &after_key {
                Some(key) => compare_keys(&key_of(table, row), key) == Ordering::Greater,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TargetWriter for MemoryDatabase {
    async fn apply_batch(
        &self,
        table: &TableSpec,
        batch: &RowBatch,
        policy: ConflictPolicy,
    ) -> Result<BatchOutcome> {
        let delay = self.state.lock().unwrap().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let batch_error = |message: String| Error::BatchApply {
            table: table.name.clone(),
            batch: batch.index,
            offset: batch.offset,
            message,
        };

        let mut working = state
            .table(&table.name)
            .cloned()
            .ok_or_else(|| batch_error("relation does not exist".to_string()))?;
        let mut outcome = BatchOutcome::default();

        for row in &batch.rows {
            for column in row.keys() {
                if !working.columns.contains(column) {
                    return Err(batch_error(format!("column \"{}\" does not exist", column)));
                }
            }

            for failure in state.failures.iter().filter(|f| f.table == table.name) {
                if row.get(&failure.column) == Some(&failure.value) {
                    return Err(batch_error(format!(
                        "check constraint violated by {} = {}",
                        failure.column, failure.value
                    )));
                }
            }

            for (column, parent) in &working.foreign_keys {
                let value = row.get(column).cloned().unwrap_or(Value::Null);
                let present = if parent == &table.name {
                    working
                        .rows
                        .iter()
                        .any(|r| compare_keys(&key_of(table, r), &[&value]) == Ordering::Equal)
                } else {
                    state.has_key(parent, &value)
                };
                if !value.is_null() && !present {
                    return Err(batch_error(format!(
                        "insert or update on \"{}\" violates foreign key to \"{}\"",
                        table.name, parent
                    )));
                }
            }

            let key = key_of(table, row);
            let existing = working
                .rows
                .iter()
                .position(|r| compare_keys(&key_of(table, r), &key) == Ordering::Equal);

            match existing {
                None => {
                    working.rows.push(row.clone());
                    outcome.inserted += 1;
                }
                Some(_) if policy == ConflictPolicy::InsertOnly => outcome.unchanged += 1,
                Some(idx) if &working.rows[idx] == row => outcome.unchanged += 1,
                Some(idx) => {
                    working.rows[idx] = row.clone();
                    outcome.updated += 1;
                }
            }
        }

        working
            .rows
            .sort_by(|a, b| compare_keys(&key_of(table, a), &key_of(table, b)));
        if let Some(mem) = state.table_mut(&table.name) {
            *mem = working;
        }

        state.applies += 1;
        let applies = state.applies;
        if let Some((after, sender)) = &state.cancel_after {
            if applies >= *after {
                let _ = sender.send(true);
            }
        }

        Ok(outcome)
    }

    async fn clear_tables(&self, tables: &[&TableSpec]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut deleted = 0;
        for spec in tables {
            if let Some(mem) = state.table_mut(&spec.name) {
                deleted += mem.rows.len() as u64;
                mem.rows.clear();
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl SchemaCatalog for MemoryDatabase {
    async fn discover_tables(&self, _schema: &str) -> Result<Vec<TableSpec>> {
        let state = self.state.lock().unwrap();
        Ok(state.tables.iter().map(|t| t.spec.clone()).collect())
    }
}

fn compare_keys(a: &[&Value], b: &[&Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (x, y) => x.to_string().cmp(&y.to_string()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
