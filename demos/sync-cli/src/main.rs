//! A dev-only smoke test: spins up a mock sync server, wires a
//! [`sync_engine::SyncConfig`] against it, and exercises
//! `init` -> `write` -> `full_sync` -> `shutdown` end to end, logging what
//! happened at each step. Not part of the public API surface; nothing here
//! is exercised by downstream applications.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use sync_engine::config::EntityMetadata;
use sync_engine::{SyncConfig, SyncOrchestrator};
use url::Url;

fn items_migration(conn: &rusqlite::Connection) -> sync_engine::Result<()> {
    conn.execute_batch(
        "CREATE TABLE items (
            id TEXT PRIMARY KEY,
            lts INTEGER,
            is_unsynced INTEGER NOT NULL DEFAULT 0,
            name TEXT
        )",
    )?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("sync_engine=debug,sync_cli=debug"));

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/latest-lts")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"{"lts": 0}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/data")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data": []}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/data")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results": [{"id": "demo-1", "status": "accepted", "lts": 1}]}"#)
        .create_async()
        .await;

    let mut entities = HashMap::new();
    entities.insert(
        "items".to_string(),
        EntityMetadata::new(
            "items",
            vec!["id".to_string(), "lts".to_string(), "name".to_string()],
        ),
    );

    let base_dir = tempfile::tempdir().expect("tempdir");
    let config = SyncConfig {
        app_id: "demo-app".to_string(),
        server_url: Url::parse(&server.url()).unwrap(),
        get_auth_token: Arc::new(|| Box::pin(async { Ok("demo-token".to_string()) })),
        entities: Arc::new(entities),
        migrations: Arc::new(vec![items_migration as sync_engine::config::MigrationFn]),
        base_dir: base_dir.path().to_path_buf(),
        pull_page_size: 1000,
        push_batch_size: 100,
    };

    log::info!("initializing orchestrator for user 'demo-user'");
    let orchestrator = SyncOrchestrator::init(config, "demo-user")
        .await
        .expect("init failed");

    let mut row = JsonMap::new();
    row.insert("id".to_string(), JsonValue::String("demo-1".to_string()));
    row.insert("name".to_string(), JsonValue::String("hello from sync-cli".to_string()));
    log::info!("writing a row locally");
    orchestrator.write("items", row).await.expect("write failed");

    log::info!("running full_sync");
    let result = orchestrator.full_sync().await.expect("full_sync failed");
    log::info!("full_sync finished with status {:?}", result.service_status);

    let rows = orchestrator
        .get_all("SELECT * FROM items", &[])
        .expect("read failed");
    log::info!("local 'items' table now contains: {rows:?}");

    orchestrator.shutdown();
    log::info!("done");
}
