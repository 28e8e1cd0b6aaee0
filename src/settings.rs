//! One-time seeding of application settings rows.
//!
//! Not used by the sync engine. Rows whose key already exists are left
//! untouched, so seeding can be repeated safely.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::postgres::sql::qualified;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_setting_type")]
    pub setting_type: String,
}

fn default_setting_type() -> String {
    "string".to_string()
}

/// Reads a JSON array of settings rows.
pub async fn load_settings(path: impl AsRef<Path>) -> Result<Vec<SettingRow>> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let rows: Vec<SettingRow> = serde_json::from_str(&content)?;

    for row in &rows {
        if row.key.trim().is_empty() {
            return Err(Error::Config("settings row with an empty key".to_string()));
        }
    }
    Ok(rows)
}

pub fn insert_statement(schema: &str, table: &str) -> String {
    format!(
        "INSERT INTO {} (key, value, description, type) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (key) DO NOTHING",
        qualified(schema, table)
    )
}

/// Inserts `rows` in one transaction and returns how many were new.
pub async fn seed_settings(
    client: &mut Client,
    schema: &str,
    table: &str,
    rows: &[SettingRow],
) -> Result<u64> {
    let statement = insert_statement(schema, table);
    let tx = client.transaction().await?;
    let prepared = tx.prepare(&statement).await?;

    let mut inserted = 0;
    for row in rows {
        let n = tx
            .execute(
                &prepared,
                &[&row.key, &row.value, &row.description, &row.setting_type],
            )
            .await?;
        if n == 0 {
            debug!(key = %row.key, "Setting already present");
        }
        inserted += n;
    }
    tx.commit().await?;

    info!(
        table,
        inserted,
        skipped = rows.len() as u64 - inserted,
        "Seeded settings"
    );
    Ok(inserted)
}
