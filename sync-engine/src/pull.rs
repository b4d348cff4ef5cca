//! The Pull Engine (spec §4.3): an incremental, page-based downloader. For
//! each registered entity it requests rows with `lts` strictly greater than
//! the stored watermark, applies them as upserts (or, for the tombstone
//! entity, as targeted deletes), and advances the watermark — never
//! touching `is_unsynced` on the way in (invariant I1).

use std::collections::HashMap;
use std::sync::Arc;

use interrupt_support::Interruptee;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use crate::config::{EntityMetadata, ARCHIVE_TABLE};
use crate::db::{row_i64, LocalStore, StoreTx};
use crate::error::Result;
use crate::http::SyncHttpClient;
use crate::value::json_to_sql;

pub struct PullEngine {
    store: Arc<LocalStore>,
    http: Arc<SyncHttpClient>,
    entities: Arc<HashMap<String, EntityMetadata>>,
    page_size: u32,
}

impl PullEngine {
    pub fn new(
        store: Arc<LocalStore>,
        http: Arc<SyncHttpClient>,
        entities: Arc<HashMap<String, EntityMetadata>>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            http,
            entities,
            page_size,
        }
    }

    /// Brings every entity in `tracked_entities` up to the server's current
    /// state, one page at a time, stopping early for an entity whose local
    /// edits are still outstanding (push must run first). `tracked_entities`
    /// is the `full_sync()`-wide list loaded once from `syncing_table`.
    pub async fn pull_once(&self, tracked_entities: &[String], interruptee: &dyn Interruptee) -> Result<()> {
        for entity_name in tracked_entities {
            interruptee.err_if_interrupted()?;
            if let Err(e) = self.pull_entity(entity_name, interruptee).await {
                log::warn!("pull failed for '{entity_name}', will retry next cycle: {e}");
            }
        }
        Ok(())
    }

    async fn pull_entity(&self, entity_name: &str, interruptee: &dyn Interruptee) -> Result<()> {
        if entity_name != ARCHIVE_TABLE && !self.entities.contains_key(entity_name) {
            log::warn!("skipping pull for unconfigured entity '{entity_name}'");
            return Ok(());
        }
        let mut watermark = self.watermark(entity_name)?;
        loop {
            interruptee.err_if_interrupted()?;
            let page = self
                .http
                .fetch_page(entity_name, watermark, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len() as u32;
            let last_lts = page.last().and_then(|r| r.get("lts")).and_then(JsonValue::as_i64);

            let deferred = self.store.write_transaction(|tx| {
                let dirty = tx.get_optional(
                    &format!("SELECT 1 FROM {entity_name} WHERE is_unsynced = 1 LIMIT 1"),
                    &[],
                )?;
                if dirty.is_some() {
                    log::debug!(
                        "'{entity_name}' has outstanding local edits, deferring pull to next cycle"
                    );
                    return Ok(true);
                }
                if entity_name == ARCHIVE_TABLE {
                    self.apply_tombstone_page(tx, &page)?;
                } else {
                    self.apply_upsert_page(tx, entity_name, &page)?;
                }
                if let Some(lts) = last_lts {
                    tx.execute(
                        "UPDATE syncing_table SET last_received_lts = ?1 WHERE entity_name = ?2",
                        &[&lts, &entity_name],
                    )?;
                }
                Ok(false)
            })?;

            if deferred || page_len < self.page_size {
                break;
            }
            watermark = last_lts;
        }
        Ok(())
    }

    fn watermark(&self, entity_name: &str) -> Result<Option<i64>> {
        let row = self.store.get_optional(
            "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
            &[&entity_name],
        )?;
        Ok(row.and_then(|r| row_i64(&r, "last_received_lts")))
    }

    /// Each tombstone row carries `(table_name, data_id, id)`. Both deletes
    /// are idempotent, satisfying R2 (processing the same tombstone twice
    /// yields the same local state).
    fn apply_tombstone_page(&self, tx: &StoreTx<'_>, page: &[JsonValue]) -> Result<()> {
        for row in page {
            let table_name = row.get("table_name").and_then(JsonValue::as_str);
            let data_id = row.get("data_id").and_then(JsonValue::as_str);
            let id = row.get("id").and_then(JsonValue::as_str);
            let (Some(table_name), Some(data_id), Some(id)) = (table_name, data_id, id) else {
                log::warn!("malformed archive row, skipping: {row}");
                continue;
            };
            if !self.entities.contains_key(table_name) {
                log::warn!("tombstone references unconfigured table '{table_name}', skipping");
                continue;
            }
            tx.execute(&format!("DELETE FROM {table_name} WHERE id = ?1"), &[&data_id])?;
            tx.execute("DELETE FROM archive WHERE id = ?1", &[&id])?;
        }
        Ok(())
    }

    /// `INSERT ... ON CONFLICT(id) DO UPDATE SET col = excluded.col` for
    /// every non-id column. `is_unsynced` is never part of the column list,
    /// so it's left at its default (0) on insert and untouched on update —
    /// invariant I1.
    fn apply_upsert_page(&self, tx: &StoreTx<'_>, entity_name: &str, page: &[JsonValue]) -> Result<()> {
        let meta = &self.entities[entity_name];
        let set_clause = meta
            .columns
            .iter()
            .filter(|c| c.as_str() != "id")
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = meta.columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {entity_name} ({cols}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {set_clause}",
            cols = meta.columns_joined,
        );
        let param_sets: Vec<Vec<SqlValue>> = page
            .iter()
            .map(|row| {
                meta.columns
                    .iter()
                    .map(|col| row.get(col).map(json_to_sql).unwrap_or(SqlValue::Null))
                    .collect()
            })
            .collect();
        tx.execute_batch_params(&sql, &param_sets)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::row_i64;
    use interrupt_support::NeverInterrupts;
    use reqwest::Client;
    use std::sync::Arc;
    use url::Url;

    fn entities() -> Arc<HashMap<String, EntityMetadata>> {
        let mut map = HashMap::new();
        map.insert(
            "items".to_string(),
            EntityMetadata::new(
                "items",
                vec!["id".to_string(), "lts".to_string(), "name".to_string()],
            ),
        );
        Arc::new(map)
    }

    fn store_with_items() -> Arc<LocalStore> {
        let store = LocalStore::open_in_memory(&[]).unwrap();
        store
            .execute(
                "CREATE TABLE items (id TEXT PRIMARY KEY, lts INTEGER, is_unsynced INTEGER NOT NULL DEFAULT 0, name TEXT)",
                &[],
            )
            .unwrap();
        Arc::new(store)
    }

    fn http_client(server_url: &str) -> Arc<SyncHttpClient> {
        Arc::new(SyncHttpClient::new(
            Client::new(),
            Url::parse(server_url).unwrap(),
            "app".to_string(),
            Arc::new(|| Box::pin(async { Ok("token".to_string()) })),
        ))
    }

    #[tokio::test]
    async fn test_fresh_install_applies_page_and_advances_watermark() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data": [
                    {"id": "a", "lts": 10, "name": "alpha"},
                    {"id": "b", "lts": 11, "name": "beta"},
                    {"id": "c", "lts": 12, "name": "gamma"}
                ]}"#,
            )
            .create_async()
            .await;

        let store = store_with_items();
        store
            .execute(
                "INSERT INTO syncing_table (entity_name, last_received_lts) VALUES ('items', 0)",
                &[],
            )
            .unwrap();
        let engine = PullEngine::new(store.clone(), http_client(&server.url()), entities(), 1000);
        engine
            .pull_once(&["items".to_string()], &NeverInterrupts)
            .await
            .unwrap();

        let rows = store.get_all("SELECT * FROM items ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(row_i64(&rows[0], "lts"), Some(10));
        assert_eq!(row_i64(&rows[0], "is_unsynced"), Some(0));

        let watermark = store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = 'items'",
                &[],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row_i64(&watermark, "last_received_lts"), Some(12));
    }

    #[tokio::test]
    async fn test_dirty_rows_defer_the_pull() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": [{"id": "a", "lts": 10, "name": "alpha"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let store = store_with_items();
        store
            .execute(
                "INSERT INTO items (id, is_unsynced, name) VALUES ('local', 1, 'pending-edit')",
                &[],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO syncing_table (entity_name, last_received_lts) VALUES ('items', 0)",
                &[],
            )
            .unwrap();
        let engine = PullEngine::new(store.clone(), http_client(&server.url()), entities(), 1000);
        engine
            .pull_once(&["items".to_string()], &NeverInterrupts)
            .await
            .unwrap();

        // The page was fetched once, but never applied, and the watermark
        // didn't move.
        m.assert_async().await;
        let watermark = store
            .get_optional(
                "SELECT last_received_lts FROM syncing_table WHERE entity_name = 'items'",
                &[],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row_i64(&watermark, "last_received_lts"), Some(0));
        let rows = store.get_all("SELECT * FROM items", &[]).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_deletes_row_and_drops_archive_entry() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data": [{"id": "arch-1", "table_name": "items", "data_id": "c", "lts": 51}]}"#,
            )
            .create_async()
            .await;

        let store = store_with_items();
        store
            .execute(
                "INSERT INTO items (id, lts, name) VALUES ('c', 9, 'to-delete')",
                &[],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO archive (id, table_name, data_id, lts) VALUES ('arch-1', 'items', 'c', NULL)",
                &[],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO syncing_table (entity_name, last_received_lts) VALUES ('archive', 50)",
                &[],
            )
            .unwrap();

        let engine = PullEngine::new(store.clone(), http_client(&server.url()), entities(), 1000);
        engine
            .pull_once(&["archive".to_string()], &NeverInterrupts)
            .await
            .unwrap();

        assert!(store.get_all("SELECT * FROM items", &[]).unwrap().is_empty());
        assert!(store.get_all("SELECT * FROM archive", &[]).unwrap().is_empty());
    }
}
