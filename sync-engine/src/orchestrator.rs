//! The Sync Orchestrator (spec §4.5): the façade user code actually talks
//! to. It owns the local store, gates `full_sync()` so at most one runs at
//! a time (coalescing bursts of triggers into at most one extra cycle), and
//! starts/stops the Event Channel Listener (§4.6). Grounded on
//! `sync15::sync_multiple`'s role as the top-level entry point that drives
//! the per-collection engines and reports a single `SyncResult`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use interrupt_support::{Interruptable, ShutdownFlag};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::config::SyncConfig;
use crate::db::{row_str, LocalStore};
use crate::error::{Error, Result, ServiceStatus};
use crate::events::EventChannelListener;
use crate::http::SyncHttpClient;
use crate::ids::Guid;
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::registrar::TableRegistrar;
use crate::value::{row_to_json, sql_to_json};

/// The outcome of one `full_sync()` cycle, modeled on `sync15::status::SyncResult`.
#[derive(Debug)]
pub struct SyncResult {
    pub service_status: ServiceStatus,
    pub entity_results: HashMap<String, Result<()>>,
}

impl SyncResult {
    fn ok(entities: &[String]) -> Self {
        Self {
            service_status: ServiceStatus::Ok,
            entity_results: entities.iter().map(|e| (e.clone(), Ok(()))).collect(),
        }
    }
}

#[derive(Default)]
struct GateState {
    in_progress: bool,
    repeat: bool,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<LocalStore>,
    http: Arc<SyncHttpClient>,
    registrar: TableRegistrar,
    pull: PullEngine,
    push: PushEngine,
    gate: Mutex<GateState>,
    event_channel_connected: Arc<AtomicBool>,
    shutdown: ShutdownFlag,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Opens `<base_dir>/<app_id>/<user_id>/helper_sync.db`, runs migrations,
    /// registers the tombstone entity and every configured application
    /// entity, then starts the event channel listener (which itself kicks
    /// off the first `full_sync()` once connected).
    ///
    /// Registering application entities here rather than from inside a
    /// migration closure is a deliberate departure from the letter of spec
    /// §4.2 ("application entities are registered by the generated
    /// migration scripts"): migrations run synchronously against a bare
    /// `&Connection` with no HTTP client available yet, and registration
    /// requires an async round-trip to `/latest-lts`. Migrations still own
    /// all table DDL; `init()` performs the registrar's HTTP-backed
    /// bookkeeping immediately afterward, before any sync activity, which
    /// preserves invariant I5 (tombstone watermark seeded from the server's
    /// current high-water mark so historic data isn't replayed).
    pub async fn init(config: SyncConfig, user_id: &str) -> Result<Arc<Self>> {
        let db_path = config.db_path(user_id);
        log::info!("opening sync database for user at {:?}", db_path);
        let store = Arc::new(LocalStore::open(&db_path, &config.migrations)?);

        let http = Arc::new(SyncHttpClient::new(
            Client::new(),
            config.server_url.clone(),
            config.app_id.clone(),
            config.get_auth_token.clone(),
        ));

        let registrar = TableRegistrar::new(store.clone(), http.clone());
        registrar.register_archive_entity().await?;
        for entity_name in config.entities.keys() {
            registrar.register_table(entity_name).await?;
        }

        let pull = PullEngine::new(store.clone(), http.clone(), config.entities.clone(), config.pull_page_size);
        let push = PushEngine::new(store.clone(), http.clone(), config.entities.clone(), config.push_batch_size);

        let orchestrator = Arc::new(Self {
            config,
            store,
            http,
            registrar,
            pull,
            push,
            gate: Mutex::new(GateState::default()),
            event_channel_connected: Arc::new(AtomicBool::new(false)),
            shutdown: ShutdownFlag::new(),
            event_task: Mutex::new(None),
        });

        orchestrator.start_event_listener();
        orchestrator.store.notify();
        Ok(orchestrator)
    }

    fn start_event_listener(self: &Arc<Self>) {
        let listener_store = self.store.clone();
        let listener_http = self.http.clone();
        let connected = self.event_channel_connected.clone();
        let shutdown = self.shutdown.clone();
        let weak = Arc::downgrade(self);
        let on_event: crate::events::SyncTrigger = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(orchestrator) = weak.upgrade() {
                    if let Err(e) = orchestrator.full_sync().await {
                        log::warn!("full_sync triggered by event channel failed: {e}");
                    }
                }
            })
        });
        let listener = EventChannelListener::new(listener_store, listener_http, on_event);
        let handle = tokio::spawn(async move {
            listener.run(&connected, &shutdown).await;
        });
        *self.event_task.lock() = Some(handle);
    }

    /// Writes (inserts or updates) one row. Strips any caller-supplied `lts`
    /// (invariant I2 — `lts` is server-owned), assigns a fresh id if absent,
    /// and marks the row dirty. Triggers a fire-and-forget `full_sync()`.
    pub async fn write(self: &Arc<Self>, table: &str, mut data: JsonMap<String, JsonValue>) -> Result<()> {
        data.remove("lts");
        let id = match data.get("id").and_then(JsonValue::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Guid::random().to_string();
                data.insert("id".to_string(), JsonValue::String(id.clone()));
                id
            }
        };
        let meta = self
            .config
            .entities
            .get(table)
            .ok_or_else(|| Error::Other(format!("'{table}' is not a configured syncable entity")))?;

        // `lts` is excluded from the UPDATE SET clause as well as `id`: it is
        // server-owned (I2), and a user edit to an existing row must leave
        // the row's current `lts` untouched rather than overwrite it with
        // the null left behind by stripping any caller-supplied value above.
        let columns: Vec<&String> = meta
            .columns
            .iter()
            .filter(|c| c.as_str() != "id" && c.as_str() != "lts")
            .collect();
        let insert_cols = meta.columns_joined.clone();
        let insert_placeholders = meta.columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let update_clause = columns
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({insert_cols}, is_unsynced) VALUES ({insert_placeholders}, 1) \
             ON CONFLICT(id) DO UPDATE SET {update_clause}, is_unsynced = 1",
        );

        let insert_params: Vec<rusqlite::types::Value> = meta
            .columns
            .iter()
            .map(|c| data.get(c).map(crate::value::json_to_sql).unwrap_or(rusqlite::types::Value::Null))
            .collect();
        let update_params: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|c| data.get(*c).map(crate::value::json_to_sql).unwrap_or(rusqlite::types::Value::Null))
            .collect();
        let mut all_params = insert_params;
        all_params.extend(update_params);

        self.store.execute_batch_params(&sql, &[all_params])?;
        log::debug!("wrote dirty row '{id}' into '{table}'");

        self.trigger_full_sync();
        Ok(())
    }

    /// Deletes a row by id, inserting an archive tombstone in the same
    /// transaction (invariant I6). A no-op delete (row already absent) is
    /// still logged and still triggers a sync, matching spec §4.5.
    pub async fn delete(self: &Arc<Self>, table: &str, id: &str) -> Result<()> {
        let meta = self
            .config
            .entities
            .get(table)
            .ok_or_else(|| Error::Other(format!("'{table}' is not a configured syncable entity")))?;
        let columns_joined = meta.columns_joined.clone();

        self.store.write_transaction(|tx| {
            let existing = tx.get_optional(
                &format!("SELECT {columns_joined} FROM {table} WHERE id = ?1"),
                &[&id],
            )?;
            let Some(existing) = existing else {
                log::info!("delete('{table}', '{id}') was a no-op: row not present");
                return Ok(());
            };
            let payload = row_to_json(&existing, &meta.columns);
            let archive_id = Guid::random().to_string();
            tx.execute(
                "INSERT INTO archive (id, table_name, data_id, data, is_unsynced) VALUES (?1, ?2, ?3, ?4, 1)",
                &[&archive_id, &table, &id, &payload.to_string()],
            )?;
            tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), &[&id])?;
            Ok(())
        })?;

        self.trigger_full_sync();
        Ok(())
    }

    /// Fire-and-forget: spawns `full_sync()` on the current runtime rather
    /// than awaiting it inline, matching spec §4.5's "Triggers `full_sync()`
    /// (fire-and-forget; see sync gating below)".
    fn trigger_full_sync(self: &Arc<Self>) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.full_sync().await {
                log::warn!("full_sync failed: {e}");
            }
        });
    }

    /// One push-then-pull pass over every registered entity. Debounced: if
    /// called while a sync is already running, sets a `repeat` flag and
    /// returns immediately; on completion, a pending `repeat` causes another
    /// cycle to run before this call returns, collapsing any burst of
    /// triggers that arrived mid-flight into the tail of the one already
    /// running rather than queuing a fresh call per trigger.
    pub async fn full_sync(self: &Arc<Self>) -> Result<SyncResult> {
        {
            let mut gate = self.gate.lock();
            if gate.in_progress {
                gate.repeat = true;
                log::debug!("full_sync already running, marked for repeat");
                return Ok(SyncResult {
                    service_status: ServiceStatus::Ok,
                    entity_results: HashMap::new(),
                });
            }
            gate.in_progress = true;
        }

        self.store.notify();
        log::info!("full_sync starting");
        let mut result = self.run_sync_loop().await;
        loop {
            let repeat = {
                let mut gate = self.gate.lock();
                std::mem::take(&mut gate.repeat)
            };
            if !repeat {
                break;
            }
            log::debug!("re-running full_sync to absorb work queued mid-cycle");
            result = self.run_sync_loop().await;
        }
        self.gate.lock().in_progress = false;
        log::info!("full_sync finished");
        self.store.notify();
        result
    }

    async fn run_sync_loop(self: &Arc<Self>) -> Result<SyncResult> {
        let tracked_entities = self.tracked_entities()?;
        if let Err(e) = self.push.push_once(&tracked_entities, &self.shutdown).await {
            log::warn!("push phase failed: {e}");
            return Ok(SyncResult {
                service_status: ServiceStatus::from_err(&e),
                entity_results: HashMap::new(),
            });
        }
        if let Err(e) = self.pull.pull_once(&tracked_entities, &self.shutdown).await {
            log::warn!("pull phase failed: {e}");
            return Ok(SyncResult {
                service_status: ServiceStatus::from_err(&e),
                entity_results: HashMap::new(),
            });
        }
        Ok(SyncResult::ok(&tracked_entities))
    }

    fn tracked_entities(&self) -> Result<Vec<String>> {
        let rows = self.store.get_all("SELECT entity_name FROM syncing_table", &[])?;
        Ok(rows
            .iter()
            .filter_map(|r| row_str(r, "entity_name").map(str::to_string))
            .collect())
    }

    /// Registers a new syncable entity mid-process (e.g. a feature flag
    /// enabling an entity after the app has already called `init()`), baselined
    /// against the server exactly as it would be at startup. Idempotent (R3).
    pub async fn register_table(&self, entity_name: &str) -> Result<()> {
        self.registrar.register_table(entity_name).await
    }

    pub fn is_syncing(&self) -> bool {
        self.gate.lock().in_progress
    }

    pub fn event_channel_connected(&self) -> bool {
        self.event_channel_connected.load(Ordering::SeqCst)
    }

    /// A restartable stream of results for `sql`, re-emitting after every
    /// committed mutation — the passthrough read path spec §4.5 calls for.
    pub fn watch(self: &Arc<Self>, sql: impl Into<String>, params: Vec<rusqlite::types::Value>) -> crate::db::ChangeStream {
        self.store.watch(sql, params)
    }

    pub fn get_all(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<JsonValue>> {
        let rows = self.store.get_all(sql, params)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let map: JsonMap<String, JsonValue> =
                    row.into_iter().map(|(k, v)| (k, sql_to_json(&v))).collect();
                JsonValue::Object(map)
            })
            .collect())
    }

    /// Cancels the event channel subscription and flips the process-wide
    /// interrupt flag every suspension point in push/pull checks between
    /// iterations (spec §5 Cancellation). Does not drop the store or HTTP
    /// client outright — in-flight operations observe the flag and unwind
    /// on their own rather than being forcibly torn down mid-transaction.
    pub fn shutdown(&self) {
        log::info!("shutting down sync orchestrator");
        self.shutdown.interrupt();
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        self.event_channel_connected.store(false, Ordering::SeqCst);
        self.store.notify();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EntityMetadata;
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;
    use url::Url;

    fn test_config(base_dir: PathBuf, server_url: &str) -> SyncConfig {
        let mut entities = HashMap::new();
        entities.insert(
            "items".to_string(),
            EntityMetadata::new(
                "items",
                vec!["id".to_string(), "lts".to_string(), "name".to_string()],
            ),
        );
        fn create_items(conn: &rusqlite::Connection) -> Result<()> {
            conn.execute_batch(
                "CREATE TABLE items (id TEXT PRIMARY KEY, lts INTEGER, is_unsynced INTEGER NOT NULL DEFAULT 0, name TEXT)",
            )?;
            Ok(())
        }
        SyncConfig {
            app_id: "testapp".to_string(),
            server_url: Url::parse(server_url).unwrap(),
            get_auth_token: StdArc::new(|| Box::pin(async { Ok("token".to_string()) })),
            entities: StdArc::new(entities),
            migrations: StdArc::new(vec![create_items]),
            base_dir,
            pull_page_size: 1000,
            push_batch_size: 100,
        }
    }

    #[tokio::test]
    async fn test_init_registers_archive_and_entities() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 0}"#)
            .create_async()
            .await;
        // The event listener will also try to connect; let it fail
        // harmlessly (no mock for /events means mockito 501s it, which the
        // listener treats as a routine connect failure and retries).
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        let tracked = orchestrator.tracked_entities().unwrap();
        assert!(tracked.contains(&"archive".to_string()));
        assert!(tracked.contains(&"items".to_string()));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_write_strips_lts_and_marks_dirty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 0}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        let mut data = JsonMap::new();
        data.insert("id".to_string(), JsonValue::String("a".to_string()));
        data.insert("name".to_string(), JsonValue::String("hello".to_string()));
        data.insert("lts".to_string(), JsonValue::from(999));
        orchestrator.write("items", data).await.unwrap();

        let rows = orchestrator.get_all("SELECT * FROM items WHERE id = 'a'", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["lts"], JsonValue::Null);
        assert_eq!(rows[0]["is_unsynced"], JsonValue::from(1));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_write_to_existing_row_preserves_its_server_lts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 0}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        orchestrator
            .store
            .execute(
                "INSERT INTO items (id, lts, is_unsynced, name) VALUES ('b', 5, 0, 'local')",
                &[],
            )
            .unwrap();

        let mut data = JsonMap::new();
        data.insert("id".to_string(), JsonValue::String("b".to_string()));
        data.insert("name".to_string(), JsonValue::String("edited".to_string()));
        orchestrator.write("items", data).await.unwrap();

        let rows = orchestrator.get_all("SELECT * FROM items WHERE id = 'b'", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        // The row's existing server-assigned lts must survive the edit,
        // not be clobbered to null (invariant I2 / P2).
        assert_eq!(rows[0]["lts"], JsonValue::from(5));
        assert_eq!(rows[0]["name"], JsonValue::String("edited".to_string()));
        assert_eq!(rows[0]["is_unsynced"], JsonValue::from(1));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_delete_is_atomic_with_tombstone_insert() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 0}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        let mut data = JsonMap::new();
        data.insert("id".to_string(), JsonValue::String("c".to_string()));
        data.insert("name".to_string(), JsonValue::String("to-delete".to_string()));
        orchestrator.write("items", data).await.unwrap();

        orchestrator.delete("items", "c").await.unwrap();

        assert!(orchestrator
            .get_all("SELECT * FROM items WHERE id = 'c'", &[])
            .unwrap()
            .is_empty());
        let archived = orchestrator
            .get_all("SELECT * FROM archive WHERE data_id = 'c'", &[])
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0]["table_name"], JsonValue::String("items".to_string()));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_delete_nonexistent_row_is_a_logged_no_op() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 0}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        orchestrator.delete("items", "missing").await.unwrap();
        assert!(orchestrator.get_all("SELECT * FROM archive", &[]).unwrap().is_empty());
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_full_sync_coalesces_concurrent_triggers() {
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
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), &server.url());
        let orchestrator = SyncOrchestrator::init(config, "user-1").await.unwrap();

        let a = orchestrator.clone();
        let b = orchestrator.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.full_sync().await }),
            tokio::spawn(async move { b.full_sync().await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();
        assert!(!orchestrator.is_syncing());
        orchestrator.shutdown();
    }
}
