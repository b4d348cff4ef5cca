/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small SQLite helpers shared between the `sync-engine` crate's local
//! store and its tests: a `ConnExt` trait giving `Connection`/`Transaction`/
//! `Savepoint` a few convenience methods, and `open_database`, a
//! version-pragma-based migration runner.

mod conn_ext;
mod open_database;

pub use conn_ext::*;
pub use open_database::{
    open_database, open_database_with_flags, test_utils, DatabaseLocation, Error, MigrationFn,
    MigrationLogic, Result as MigrationResult,
};

/// In `PRAGMA foo='bar'`, `'bar'` must be a constant string (it cannot be a
/// bound parameter), so callers that interpolate must escape manually. The
/// only character SQLite requires escaping is the single quote, doubled.
pub fn escape_string_for_pragma(s: &str) -> String {
    s.replace('\'', "''")
}
