//! The configuration surface enumerated in spec §6: everything the host
//! application supplies once at construction time and that stays immutable
//! for the life of the process. Modeled on `Sync15StorageClientInit` (the
//! bearer-token/base-URL half) merged with the per-collection metadata the
//! teacher's generated `EngineSyncAssociation`/collection list carries.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use rusqlite::Connection;
use url::Url;

use crate::error::Result;

/// Ordered, immutable metadata for one syncable entity: the column
/// projection used for both upload (dirty-row select) and download
/// (upsert), and a pre-joined comma-separated form for direct SQL
/// interpolation in the dirty-row `SELECT` — computed once here rather
/// than re-joined on every query, per spec §3's "Entity Metadata (static)".
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub table: String,
    pub columns: Vec<String>,
    pub columns_joined: String,
}

impl EntityMetadata {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        let columns_joined = columns.join(", ");
        Self {
            table: table.into(),
            columns,
            columns_joined,
        }
    }
}

/// One schema-version transition, applied inside a transaction. `migrations[i]`
/// upgrades a database at schema version `i` to version `i + 1`; a brand new
/// database starts at version 0 and runs every migration in order, so there's
/// no separate "init" shortcut to keep in sync with the upgrade path.
pub type MigrationFn = fn(&Connection) -> Result<()>;

type AuthTokenFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Returns a bearer token on demand; invoked once per HTTP request since
/// tokens are short-lived (spec §6).
pub type GetAuthToken = Arc<dyn Fn() -> AuthTokenFuture + Send + Sync>;

/// The name of the tombstone entity's table, fixed by the wire protocol
/// (spec §6's `archive` table) and therefore not part of `entities`.
pub const ARCHIVE_TABLE: &str = "archive";

#[derive(Clone)]
pub struct SyncConfig {
    /// Multi-tenant discriminator sent on every request.
    pub app_id: String,
    /// Base URL for `/latest-lts`, `/data`, and `/events`.
    pub server_url: Url,
    /// Returns a bearer token, invoked fresh for every request.
    pub get_auth_token: GetAuthToken,
    /// Syncable entities, keyed by entity/table name. Does not include the
    /// tombstone entity, which carries its own fixed schema.
    pub entities: Arc<HashMap<String, EntityMetadata>>,
    /// Ordered schema migrations, run to completion before any sync activity.
    pub migrations: Arc<Vec<MigrationFn>>,
    /// Root directory under which `<app_id>/<user_id>/helper_sync.db` is created.
    pub base_dir: PathBuf,
    /// Page size for pull requests (spec §4.3: canonical 1000).
    pub pull_page_size: u32,
    /// Batch size for push requests (spec §4.4: canonical 100).
    pub push_batch_size: u32,
}

impl SyncConfig {
    pub fn db_path(&self, user_id: &str) -> PathBuf {
        self.base_dir
            .join(&self.app_id)
            .join(user_id)
            .join("helper_sync.db")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_entity_metadata_prejoins_columns() {
        let meta = EntityMetadata::new(
            "items",
            vec!["id".to_string(), "lts".to_string(), "name".to_string()],
        );
        assert_eq!(meta.columns_joined, "id, lts, name");
    }

    #[test]
    fn test_db_path_layout() {
        let config = SyncConfig {
            app_id: "myapp".to_string(),
            server_url: Url::parse("https://sync.example.com").unwrap(),
            get_auth_token: Arc::new(|| Box::pin(async { Ok("token".to_string()) })),
            entities: Arc::new(HashMap::new()),
            migrations: Arc::new(Vec::new()),
            base_dir: PathBuf::from("/docs"),
            pull_page_size: 1000,
            push_batch_size: 100,
        };
        assert_eq!(
            config.db_path("user-1"),
            PathBuf::from("/docs/myapp/user-1/helper_sync.db")
        );
    }
}
