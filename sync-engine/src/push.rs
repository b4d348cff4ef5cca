//! The Push Engine (spec §4.4): uploads dirty rows for each registered
//! entity in fixed-size batches, re-reads each row right before applying
//! the server's verdict (a "deep equality" check against what was sent),
//! and only ever clears `is_unsynced`/stamps `lts` for rows that still
//! match what was uploaded.

use std::collections::HashMap;
use std::sync::Arc;

use interrupt_support::Interruptee;
use serde_json::Value as JsonValue;

use crate::config::{EntityMetadata, ARCHIVE_TABLE};
use crate::db::{row_str, LocalStore, Row, StoreTx};
use crate::error::Result;
use crate::http::{PushResult, SyncHttpClient};
use crate::value::row_to_json;

/// The tombstone entity's syncable columns (spec §6's `archive` table),
/// fixed by the wire protocol rather than supplied by the host application —
/// it is uploaded like any other dirty entity (spec §3, §4.4).
fn archive_metadata() -> EntityMetadata {
    EntityMetadata::new(
        ARCHIVE_TABLE,
        vec![
            "id".to_string(),
            "table_name".to_string(),
            "data".to_string(),
            "data_id".to_string(),
            "lts".to_string(),
        ],
    )
}

pub struct PushEngine {
    store: Arc<LocalStore>,
    http: Arc<SyncHttpClient>,
    entities: Arc<HashMap<String, EntityMetadata>>,
    batch_size: u32,
}

impl PushEngine {
    pub fn new(
        store: Arc<LocalStore>,
        http: Arc<SyncHttpClient>,
        entities: Arc<HashMap<String, EntityMetadata>>,
        batch_size: u32,
    ) -> Self {
        let mut entities = (*entities).clone();
        entities.entry(ARCHIVE_TABLE.to_string()).or_insert_with(archive_metadata);
        Self {
            store,
            http,
            entities: Arc::new(entities),
            batch_size,
        }
    }

    /// Uploads every dirty row for every entity in `tracked_entities`, one
    /// batch at a time. A transport failure for one entity is logged and
    /// skipped so the remaining entities still get a chance to push this
    /// cycle. `tracked_entities` is the `full_sync()`-wide list loaded once
    /// from `syncing_table`, and includes the tombstone entity.
    pub async fn push_once(&self, tracked_entities: &[String], interruptee: &dyn Interruptee) -> Result<()> {
        for entity_name in tracked_entities {
            interruptee.err_if_interrupted()?;
            if !self.entities.contains_key(entity_name) {
                continue;
            }
            if let Err(e) = self.push_entity(entity_name).await {
                log::warn!("push failed for '{entity_name}', will retry next cycle: {e}");
            }
        }
        Ok(())
    }

    async fn push_entity(&self, entity_name: &str) -> Result<()> {
        let meta = &self.entities[entity_name];
        loop {
            let dirty = self.dirty_batch(entity_name, meta)?;
            if dirty.is_empty() {
                break;
            }
            let batch_len = dirty.len();
            let payload: Vec<JsonValue> = dirty
                .iter()
                .map(|row| row_to_json(row, &meta.columns))
                .collect();
            let results = self.http.push_batch(entity_name, &payload).await?;
            self.apply_results(entity_name, meta, &dirty, &results)?;
            if batch_len < self.batch_size as usize {
                break;
            }
        }
        Ok(())
    }

    /// Selects up to `batch_size` dirty rows, ordered by id for a stable
    /// cursor across repeated calls within the same push cycle.
    fn dirty_batch(&self, entity_name: &str, meta: &EntityMetadata) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {cols} FROM {entity_name} WHERE is_unsynced = 1 ORDER BY id LIMIT ?1",
            cols = meta.columns_joined,
        );
        self.store.get_all(&sql, &[&self.batch_size])
    }

    /// Re-reads each uploaded row inside a single write transaction and
    /// compares it, column by column, against what was actually sent. Only
    /// a row that still matches gets its verdict applied; anything that
    /// changed locally in the meantime is left dirty for the next cycle.
    fn apply_results(
        &self,
        entity_name: &str,
        meta: &EntityMetadata,
        sent: &[Row],
        results: &[PushResult],
    ) -> Result<()> {
        let results_by_id: HashMap<&str, &PushResult> =
            results.iter().map(|r| (r.id.as_str(), r)).collect();

        self.store.write_transaction(|tx| {
            for row in sent {
                let Some(id) = row_str(row, "id") else { continue };
                let Some(result) = results_by_id.get(id) else {
                    log::warn!("server returned no verdict for '{entity_name}' row '{id}'");
                    continue;
                };
                let current = tx.get_optional(
                    &format!(
                        "SELECT {cols} FROM {entity_name} WHERE id = ?1",
                        cols = meta.columns_joined
                    ),
                    &[&id],
                )?;
                let Some(current) = current else {
                    // Deleted locally while the request was in flight; the
                    // delete path already handles server-side cleanup.
                    continue;
                };
                if !rows_equal(row, &current, &meta.columns) {
                    log::debug!(
                        "'{entity_name}' row '{id}' changed again before the push verdict landed, leaving dirty"
                    );
                    continue;
                }
                self.apply_verdict(tx, entity_name, id, result)?;
            }
            Ok(())
        })
    }

    fn apply_verdict(
        &self,
        tx: &StoreTx<'_>,
        entity_name: &str,
        id: &str,
        result: &PushResult,
    ) -> Result<()> {
        match result.status.as_str() {
            "accepted" => {
                tx.execute(
                    &format!("UPDATE {entity_name} SET is_unsynced = 0, lts = ?1 WHERE id = ?2"),
                    &[&result.lts, &id],
                )?;
            }
            other => {
                if other != "rejected" {
                    log::warn!("unrecognized push verdict '{other}' for '{entity_name}' row '{id}', treating as rejected");
                }
                tx.execute(
                    &format!("UPDATE {entity_name} SET is_unsynced = 0 WHERE id = ?1"),
                    &[&id],
                )?;
            }
        }
        Ok(())
    }
}

fn rows_equal(a: &Row, b: &Row, columns: &[String]) -> bool {
    columns.iter().all(|c| a.get(c) == b.get(c))
}
