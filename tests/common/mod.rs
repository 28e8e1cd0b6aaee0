#![allow(dead_code)]

use prod_sync::config::{Config, SyncOptions, SyncTarget};
use std::env;
use tokio_postgres::{Client, NoTls};

/// Endpoint built from `TEST_<PREFIX>_*` variables.
fn endpoint(prefix: &str, default_db: &str) -> SyncTarget {
    let var = |name: &str| env::var(format!("TEST_{}_{}", prefix, name)).ok();

    SyncTarget {
        host: var("HOST").unwrap_or_else(|| "localhost".to_string()),
        port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(5432),
        database: var("DATABASE").unwrap_or_else(|| default_db.to_string()),
        username: var("USERNAME").unwrap_or_else(|| "postgres".to_string()),
        password: var("PASSWORD").unwrap_or_else(|| "postgres".to_string()),
        max_connections: 4,
        connect_timeout_secs: 10,
        application_name: format!("prod-sync-test-{}", std::process::id()),
    }
}

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    Config {
        source: endpoint("SOURCE", "prod_sync_source"),
        target: endpoint("TARGET", "prod_sync_target"),
        sync: SyncOptions {
            schema: format!("sync_test_{}", std::process::id()),
            batch_size: 2,
            call_timeout_secs: 30,
            ..SyncOptions::default()
        },
    }
}

pub async fn connect(target: &SyncTarget) -> Client {
    let (client, connection) = target.pg_config().connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });
    client
}

/// Recreates the teams/players schema on both sides.
pub async fn setup_schema(config: &Config) -> (Client, Client) {
    let source = connect(&config.source).await;
    let target = connect(&config.target).await;
    let schema = &config.sync.schema;

    let ddl = format!(
        r#"
        DROP SCHEMA IF EXISTS {schema} CASCADE;
        CREATE SCHEMA {schema};
        CREATE TABLE {schema}.teams (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE {schema}.players (
            id INTEGER PRIMARY KEY,
            team_id INTEGER NOT NULL REFERENCES {schema}.teams(id),
            name TEXT NOT NULL,
            rating NUMERIC(6, 2)
        );
        "#
    );
    source.batch_execute(&ddl).await.unwrap();
    target.batch_execute(&ddl).await.unwrap();

    (source, target)
}

pub async fn drop_schema(config: &Config, source: &Client, target: &Client) {
    let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", config.sync.schema);
    source.batch_execute(&sql).await.ok();
    target.batch_execute(&sql).await.ok();
}

pub async fn count(client: &Client, schema: &str, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT count(*) FROM {}.{}", schema, table), &[])
        .await
        .unwrap()
        .get(0)
}
