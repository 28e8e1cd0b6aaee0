//! SQL text for extraction and upserts.
//!
//! Rows travel as JSON: the source renders each row with `to_jsonb`, the
//! target rebuilds typed rows with `jsonb_populate_recordset` against its own
//! table type. Values are therefore converted by the target column types
//! only, and a value that does not fit its column fails the statement.

use postgres_protocol::escape::escape_identifier;
use std::time::Duration;

use crate::config::ConflictPolicy;
use crate::plan::TableSpec;

pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(table))
}

fn column_list(prefix: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}{}", prefix, escape_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Columns rendered as text, for comparing types without an equality
/// operator (`json`, `xml`, `point`).
fn text_list(prefix: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}{}::text", prefix, escape_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn count_rows(schema: &str, table: &str) -> String {
    format!("SELECT count(*) FROM {}", qualified(schema, table))
}

/// Keyset page ordered by primary key.
///
/// With `after_cursor`, `$1` is a JSON object holding the key columns of the
/// last row already read.
pub fn extract_rows(schema: &str, table: &TableSpec, after_cursor: bool, limit: usize) -> String {
    let relation = qualified(schema, &table.name);
    let order = column_list("t.", &table.primary_key);

    let filter = if after_cursor {
        format!(
            " WHERE ({}) > (SELECT {} FROM jsonb_populate_record(NULL::{}, $1::text::jsonb) AS c)",
            order,
            column_list("c.", &table.primary_key),
            relation
        )
    } else {
        String::new()
    };

    format!(
        "SELECT to_jsonb(t)::text FROM {} AS t{} ORDER BY {} LIMIT {}",
        relation, filter, order, limit
    )
}

/// Upsert of a JSON array passed as `$1`.
///
/// Returns one boolean per written row: `true` for inserts, `false` for
/// updates. Rows left as they were are not returned. Rows are compared by
/// the text form of their non-key columns.
pub fn upsert_rows(
    schema: &str,
    table: &TableSpec,
    columns: &[String],
    policy: ConflictPolicy,
) -> String {
    let relation = qualified(schema, &table.name);
    let value_columns: Vec<String> = columns
        .iter()
        .filter(|c| !table.is_key_column(c))
        .cloned()
        .collect();

    let conflict = if policy == ConflictPolicy::InsertOnly || value_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments = value_columns
            .iter()
            .map(|c| {
                let col = escape_identifier(c);
                format!("{} = EXCLUDED.{}", col, col)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DO UPDATE SET {} WHERE ROW({}) IS DISTINCT FROM ROW({})",
            assignments,
            text_list("t.", &value_columns),
            text_list("EXCLUDED.", &value_columns)
        )
    };

    format!(
        "INSERT INTO {relation} AS t ({cols}) \
         SELECT {source_cols} FROM jsonb_populate_recordset(NULL::{relation}, $1::text::jsonb) AS s \
         ON CONFLICT ({keys}) {conflict} \
         RETURNING (xmax = 0) AS inserted",
        relation = relation,
        cols = column_list("", columns),
        source_cols = column_list("s.", columns),
        keys = column_list("", &table.primary_key),
        conflict = conflict,
    )
}

/// Server-side limits for the statements of one batch transaction.
///
/// A statement that runs past them fails and the batch rolls back.
pub fn batch_timeouts(timeout: Duration) -> String {
    let ms = timeout.as_millis().max(1);
    format!(
        "SET LOCAL statement_timeout = {}; SET LOCAL lock_timeout = {}",
        ms, ms
    )
}

/// Self-conflicting lock so two runs cannot write the same table at once.
pub fn lock_table(schema: &str, table: &str) -> String {
    format!(
        "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
        qualified(schema, table)
    )
}

pub fn delete_all(schema: &str, table: &str) -> String {
    format!("DELETE FROM {}", qualified(schema, table))
}

pub const DISCOVER_TABLES: &str = "\
SELECT c.relname::text AS table_name,
       COALESCE((
           SELECT array_agg(a.attname::text ORDER BY k.ord)
           FROM pg_index i
           CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
           WHERE i.indrelid = c.oid AND i.indisprimary
       ), ARRAY[]::text[]) AS primary_key
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p')
  AND NOT c.relispartition
ORDER BY c.oid";

pub const DISCOVER_FOREIGN_KEYS: &str = "\
SELECT child.relname::text AS child_table,
       parent.relname::text AS parent_table
FROM pg_constraint con
JOIN pg_class child ON child.oid = con.conrelid
JOIN pg_namespace cn ON cn.oid = child.relnamespace
JOIN pg_class parent ON parent.oid = con.confrelid
JOIN pg_namespace pn ON pn.oid = parent.relnamespace
WHERE con.contype = 'f'
  AND cn.nspname = $1
  AND pn.nspname = $1
ORDER BY con.oid";
