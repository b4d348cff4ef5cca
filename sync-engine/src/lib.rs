//! An offline-first, bidirectional synchronization engine core.
//!
//! Applications read and write rows through a local embedded SQLite store
//! at all times; this crate reconciles local changes against a remote,
//! server-authoritative API in the background, keyed by a monotonic
//! per-table logical-timestamp sequence (LTS). Deletions propagate as
//! tombstone ("archive") rows through the same channel as ordinary data.
//!
//! The pieces, leaves first:
//! - [`db`] — the Local Store: a thin SQLite wrapper with transactions,
//!   batch parameter binding, and a change-broadcast query stream.
//! - [`config`] — the configuration surface an embedding application
//!   supplies once at construction (server URL, auth callback, per-entity
//!   column metadata, schema migrations).
//! - [`registrar`] — the Table Registrar: seeds a newly tracked entity's
//!   sync watermark from the server so historic data isn't replayed.
//! - [`pull`] — the Pull Engine: incremental, page-based downloads applied
//!   as upserts (or, for the tombstone entity, as targeted deletes).
//! - [`push`] — the Push Engine: batched uploads of locally dirty rows,
//!   with mid-flight verification against server verdicts.
//! - [`orchestrator`] — the façade applications use: `init`/`write`/
//!   `delete`/`full_sync`/`shutdown`, gating concurrent syncs and driving
//!   the event channel listener.
//! - [`events`] — the long-lived change-notification stream from the
//!   server that wakes the engine between explicit triggers.
//! - [`http`] — the wire transport against the four sync endpoints.
//! - [`ids`], [`value`] — small shared helpers (row ids, SQL/JSON value
//!   conversion).

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod http;
pub mod ids;
pub mod orchestrator;
pub mod pull;
pub mod push;
pub mod registrar;
pub mod value;

pub use config::{EntityMetadata, SyncConfig, ARCHIVE_TABLE};
pub use error::{Error, Result, ServiceStatus};
pub use ids::Guid;
pub use orchestrator::{SyncOrchestrator, SyncResult};
