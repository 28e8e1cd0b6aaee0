mod common;

use common::{count, drop_schema, get_test_config, setup_schema};
use prod_sync::postgres::{ConnectionPool, Endpoint, PgSource};
use prod_sync::sync::SourceReader;
use prod_sync::{sync_from_production, CancelSignal, Error, SyncEngine, SyncStatus, TableSpec};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("prod_sync=debug")
        .try_init()
        .ok();
}

#[tokio::test]
#[ignore] // Run with: cargo test --test sync_test -- --ignored
async fn test_end_to_end_sync() {
    init_tracing();

    let config = get_test_config();
    let (source, target) = setup_schema(&config).await;
    let schema = &config.sync.schema;

    source
        .batch_execute(&format!(
            r#"
            INSERT INTO {schema}.teams VALUES (1, 'Falcons'), (2, 'Hawks');
            INSERT INTO {schema}.players VALUES
                (10, 1, 'Ana', 7.25), (11, 1, 'Bo', 8.50), (12, 2, 'Cy', 9.00);
            "#
        ))
        .await
        .unwrap();

    let result = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.plan, vec!["teams", "players"]);
    assert_eq!(result.table("teams").unwrap().inserted, 2);
    assert_eq!(result.table("players").unwrap().inserted, 3);
    assert_eq!(count(&target, schema, "players").await, 3);

    let rating: String = target
        .query_one(
            &format!("SELECT rating::text FROM {schema}.players WHERE id = 10"),
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(rating, "7.25");

    // A second run with no source changes writes nothing new.
    let again = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(again.status, SyncStatus::Success);
    assert_eq!(again.totals.inserted, 0);
    assert_eq!(again.totals.updated, 0);
    assert_eq!(again.totals.unchanged, 5);

    // Source wins on conflicting keys.
    source
        .execute(
            &format!("UPDATE {schema}.teams SET name = 'Eagles' WHERE id = 2"),
            &[],
        )
        .await
        .unwrap();
    let updated = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(updated.table("teams").unwrap().updated, 1);
    let name: String = target
        .query_one(&format!("SELECT name FROM {schema}.teams WHERE id = 2"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(name, "Eagles");

    drop_schema(&config, &source, &target).await;
}

#[tokio::test]
#[ignore]
async fn test_failed_batch_is_rolled_back() {
    init_tracing();

    let mut config = get_test_config();
    config.sync.schema = format!("{}_atomic", config.sync.schema);
    let (source, target) = setup_schema(&config).await;
    let schema = &config.sync.schema;

    // The target rejects one player name, which fails that player's batch.
    target
        .batch_execute(&format!(
            "ALTER TABLE {schema}.players ADD CONSTRAINT no_mallory CHECK (name <> 'Mallory')"
        ))
        .await
        .unwrap();
    source
        .batch_execute(&format!(
            r#"
            INSERT INTO {schema}.teams VALUES (1, 'Falcons');
            INSERT INTO {schema}.players VALUES
                (1, 1, 'Ana', NULL), (2, 1, 'Bo', NULL),
                (3, 1, 'Cy', NULL), (4, 1, 'Mallory', NULL);
            "#
        ))
        .await
        .unwrap();

    let result = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(result.status, SyncStatus::PartialFailure);
    assert_eq!(result.failed_tables(), vec!["players"]);

    let players = result.table("players").unwrap();
    assert_eq!(players.inserted, 2);
    assert_eq!(players.failed, 2);
    let error = players.error.as_ref().unwrap();
    assert_eq!(error.batch, 1);
    assert_eq!(error.offset, 2);

    // Only the first batch landed; none of the failed batch did.
    assert_eq!(count(&target, schema, "players").await, 2);
    assert_eq!(count(&target, schema, "teams").await, 1);

    drop_schema(&config, &source, &target).await;
}

#[tokio::test]
#[ignore]
async fn test_unreachable_target_is_fatal() {
    init_tracing();

    let mut config = get_test_config();
    config.target.port = 1;
    config.target.connect_timeout_secs = 2;

    let result = SyncEngine::new(config)
        .with_tables(vec![TableSpec::new("teams", &["id"])])
        .run(CancelSignal::never())
        .await;

    assert!(matches!(result, Err(Error::Connection { .. })));
}

#[tokio::test]
#[ignore]
async fn test_json_columns_sync_and_update() {
    init_tracing();

    let mut config = get_test_config();
    config.sync.schema = format!("{}_json", config.sync.schema);
    let (source, target) = setup_schema(&config).await;
    let schema = &config.sync.schema;

    let ddl = format!(
        "CREATE TABLE {schema}.events (id INTEGER PRIMARY KEY, payload JSON, note TEXT)"
    );
    source.batch_execute(&ddl).await.unwrap();
    target.batch_execute(&ddl).await.unwrap();
    source
        .batch_execute(&format!(
            r#"INSERT INTO {schema}.events VALUES
                (1, '{{"kind": "goal"}}', 'first'),
                (2, '{{"kind": "foul"}}', NULL);"#
        ))
        .await
        .unwrap();

    let result = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.table("events").unwrap().inserted, 2);

    // Unchanged json rows are recognized as unchanged.
    let again = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();
    let events = again.table("events").unwrap();
    assert_eq!(events.unchanged, 2);
    assert_eq!(events.failed, 0);

    source
        .execute(
            &format!(r#"UPDATE {schema}.events SET payload = '{{"kind": "penalty"}}' WHERE id = 2"#),
            &[],
        )
        .await
        .unwrap();
    let updated = sync_from_production(&config, CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(updated.table("events").unwrap().updated, 1);

    let kind: String = target
        .query_one(
            &format!("SELECT payload->>'kind' FROM {schema}.events WHERE id = 2"),
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(kind, "penalty");

    drop_schema(&config, &source, &target).await;
}

#[tokio::test]
#[ignore]
async fn test_source_reads_share_one_snapshot() {
    init_tracing();

    let mut config = get_test_config();
    config.sync.schema = format!("{}_snapshot", config.sync.schema);
    let (source, target) = setup_schema(&config).await;
    let schema = config.sync.schema.clone();

    source
        .batch_execute(&format!("INSERT INTO {schema}.teams VALUES (1, 'Falcons')"))
        .await
        .unwrap();

    let pool = ConnectionPool::open(&config.source, Endpoint::Source)
        .await
        .unwrap();
    let reader = PgSource::begin(&pool, schema.clone()).await.unwrap();

    // Committed after the snapshot: a parent and a child referencing it.
    source
        .batch_execute(&format!(
            r#"
            INSERT INTO {schema}.teams VALUES (0, 'Late');
            INSERT INTO {schema}.players VALUES (1, 0, 'Newcomer', NULL);
            "#
        ))
        .await
        .unwrap();

    let teams = TableSpec::new("teams", &["id"]);
    let players = TableSpec::new("players", &["id"]).references("teams");
    assert_eq!(reader.count_rows(&teams).await.unwrap(), 1);
    assert_eq!(reader.extract_rows(&teams, None, 10).await.unwrap().len(), 1);
    assert_eq!(reader.count_rows(&players).await.unwrap(), 0);

    // A failed read leaves the snapshot usable.
    let missing = TableSpec::new("no_such_table", &["id"]);
    assert!(reader.count_rows(&missing).await.is_err());
    assert_eq!(reader.count_rows(&teams).await.unwrap(), 1);

    reader.finish().await.unwrap();
    assert_eq!(pool.idle_connections(), 1);

    let fresh = PgSource::begin(&pool, schema.clone()).await.unwrap();
    assert_eq!(fresh.count_rows(&teams).await.unwrap(), 2);
    fresh.finish().await.unwrap();
    pool.close();

    drop_schema(&config, &source, &target).await;
}
