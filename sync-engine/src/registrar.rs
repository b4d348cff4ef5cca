//! The Sync Metadata Table & Registrar (spec §4.2). Every entity that
//! participates in sync — including the tombstone entity — must have a
//! `syncing_table` row before the first sync cycle touches it, seeded from
//! the server's current high-water mark so historic data isn't replayed
//! (spec invariant I5).

use std::sync::Arc;
use std::time::Duration;

use crate::config::ARCHIVE_TABLE;
use crate::db::{row_i64, LocalStore};
use crate::error::Result;
use crate::http::SyncHttpClient;

const REGISTRAR_RETRY_ATTEMPTS: u32 = 3;
const REGISTRAR_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct TableRegistrar {
    store: Arc<LocalStore>,
    http: Arc<SyncHttpClient>,
}

impl TableRegistrar {
    pub fn new(store: Arc<LocalStore>, http: Arc<SyncHttpClient>) -> Self {
        Self { store, http }
    }

    /// Idempotent: a second call for an already-registered entity is a no-op.
    pub async fn register_table(&self, entity_name: &str) -> Result<()> {
        if self.watermark_row(entity_name)?.is_some() {
            return Ok(());
        }
        let baseline = self.fetch_baseline_with_retry(entity_name).await;
        // Re-check-then-insert inside a single transaction closes the race
        // between two concurrent registrars for the same entity.
        self.store.write_transaction(|tx| {
            if tx
                .get_optional(
                    "SELECT 1 FROM syncing_table WHERE entity_name = ?1",
                    &[&entity_name],
                )?
                .is_some()
            {
                return Ok(());
            }
            tx.execute(
                "INSERT INTO syncing_table (entity_name, last_received_lts) VALUES (?1, ?2)",
                &[&entity_name, &baseline],
            )?;
            Ok(())
        })
    }

    /// Convenience for startup: the tombstone entity always registers.
    pub async fn register_archive_entity(&self) -> Result<()> {
        self.register_table(ARCHIVE_TABLE).await
    }

    fn watermark_row(&self, entity_name: &str) -> Result<Option<i64>> {
        let row = self.store.get_optional(
            "SELECT last_received_lts FROM syncing_table WHERE entity_name = ?1",
            &[&entity_name],
        )?;
        Ok(row.and_then(|r| row_i64(&r, "last_received_lts")))
    }

    async fn fetch_baseline_with_retry(&self, entity_name: &str) -> i64 {
        for attempt in 1..=REGISTRAR_RETRY_ATTEMPTS {
            match self.http.latest_lts(entity_name).await {
                Ok(Some(lts)) => return lts,
                // 403/404: entity not yet known to the server.
                Ok(None) => return 0,
                Err(e) => {
                    log::warn!(
                        "latest-lts for '{entity_name}' failed (attempt {attempt}/{REGISTRAR_RETRY_ATTEMPTS}): {e}"
                    );
                    if attempt < REGISTRAR_RETRY_ATTEMPTS {
                        tokio::time::sleep(REGISTRAR_RETRY_DELAY).await;
                    }
                }
            }
        }
        log::warn!("giving up on latest-lts for '{entity_name}', baselining to 0");
        0
    }
}
