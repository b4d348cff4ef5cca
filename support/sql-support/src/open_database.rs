/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Opens a SQLite database connection and brings it to the current schema
//! version, via an ordered list of `Migration`s keyed off the
//! `PRAGMA user_version` marker. This is the concrete execution strategy
//! behind the "Migration Set (static)" entity: an ordered list of
//! schema-version transitions, each a callable applied inside a transaction,
//! run to completion before any sync activity begins.

use crate::ConnExt;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("migration error: {0}")]
    MigrationError(String),
    #[error("migration logic error: {0}")]
    MigrationLogicError(String),
    #[error("database version too old: {0}")]
    VersionTooOld(u32),
    #[error("database version too new: {0}")]
    VersionTooNew(u32),
    #[error("error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single versioned schema transition: `upgrades[i]` migrates the schema
/// from version `start_version + i` to `start_version + i + 1`.
pub type MigrationFn = fn(&Connection) -> Result<()>;

#[derive(Clone)]
pub struct MigrationLogic {
    /// Name used in log messages.
    pub name: String,
    pub start_version: u32,
    pub end_version: u32,
    /// Runs unconditionally before init/upgrade, e.g. to set up pragmas.
    pub prepare: Option<MigrationFn>,
    /// Initializes a newly created database straight to `end_version`.
    pub init: MigrationFn,
    /// `upgrades[n]` migrates version `start_version + n` to the next version.
    pub upgrades: Vec<MigrationFn>,
    pub finish: Option<MigrationFn>,
}

impl MigrationLogic {
    fn sanity_check(&self) -> Result<()> {
        let total_versions = (self.end_version - self.start_version) as usize;
        match self.upgrades.len() {
            x if x < total_versions => Err(Error::MigrationLogicError(format!(
                "not enough upgrade functions to go from {} to {}",
                self.start_version, self.end_version
            ))),
            x if x > total_versions => Err(Error::MigrationLogicError(format!(
                "too many upgrade functions to go from {} to {}",
                self.start_version, self.end_version
            ))),
            _ => Ok(()),
        }
    }

    fn run(&self, conn: &Connection, init: bool) -> Result<()> {
        log::debug!("{}: opening database", self.name);
        let tx = conn.unchecked_transaction()?;
        if let Some(prepare) = self.prepare {
            prepare(&tx)?;
        }
        if init {
            (self.init)(&tx)?;
        } else {
            let mut current_version = get_schema_version(&tx)?;
            if current_version < self.start_version {
                return Err(Error::VersionTooOld(current_version));
            } else if current_version > self.end_version {
                return Err(Error::VersionTooNew(current_version));
            }
            while current_version < self.end_version {
                let idx = (current_version - self.start_version) as usize;
                log::debug!("{}: upgrading to {}", self.name, current_version + 1);
                (self.upgrades[idx])(&tx)?;
                current_version += 1;
            }
        }
        set_schema_version(&tx, self.end_version)?;
        if let Some(finish) = self.finish {
            finish(&tx)?;
        }
        tx.commit()?;
        log::debug!("{}: database open successful", self.name);
        Ok(())
    }
}

pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    fn exists(&self) -> bool {
        match self {
            DatabaseLocation::Memory => false,
            DatabaseLocation::File(path) => path.exists(),
        }
    }

    fn open(&self, open_flags: OpenFlags) -> Result<Connection> {
        match self {
            DatabaseLocation::Memory => Ok(Connection::open_in_memory_with_flags(open_flags)?),
            DatabaseLocation::File(path) => Ok(Connection::open_with_flags(path, open_flags)?),
        }
    }
}

pub fn open_database(path: PathBuf, migration_logic: MigrationLogic) -> Result<Connection> {
    open_database_with_flags(
        DatabaseLocation::File(path),
        OpenFlags::default(),
        migration_logic,
    )
}

pub fn open_database_with_flags(
    location: DatabaseLocation,
    open_flags: OpenFlags,
    migration_logic: MigrationLogic,
) -> Result<Connection> {
    migration_logic.sanity_check()?;
    let initializing = !location.exists();
    let conn = location.open(open_flags)?;
    migration_logic.run(&conn, initializing)?;
    Ok(conn)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Not `#[cfg(test)]` so downstream crates (`sync-engine`) can use it in
/// their own tests too.
pub mod test_utils {
    use super::*;

    pub fn open_memory_database(migration: MigrationLogic) -> Result<Connection> {
        open_database_with_flags(DatabaseLocation::Memory, OpenFlags::default(), migration)
    }
}
