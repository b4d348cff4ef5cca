/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    self,
    types::FromSql,
    Connection, Params, Result as SqlResult, Row, Savepoint, Transaction, TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

/// This trait exists so that we can use these helpers on
/// `rusqlite::{Transaction, Connection, Savepoint}`. You must import
/// `ConnExt` to call these methods on anything.
pub trait ConnExt {
    /// The method you need to implement to opt in to all of this.
    fn conn(&self) -> &Connection;

    /// Execute all the provided statements in order.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    /// Equivalent to `Connection::execute` but caches the prepared statement.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like `query_row`, but returns `None` instead of erroring when no row matches.
    fn try_query_row<T, P, F>(&self, sql: &str, params: P, mapper: F) -> SqlResult<Option<T>>
    where
        Self: Sized,
        P: Params,
        F: FnOnce(&Row<'_>) -> SqlResult<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    /// Start a transaction without requiring a `&mut Connection`. The caller
    /// is responsible for not nesting these (use a `Savepoint` for that).
    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Savepoint<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite requires a mutable ref to a `Connection` to start a checked
/// `Transaction`, which is awkward when a `Connection` is shared behind a
/// `Mutex<Connection>` (the `LocalStore`'s usual shape). This offers the
/// same begin/commit/rollback-on-drop semantics against an immutable ref;
/// the caller carries the responsibility of not nesting these.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    started_at: Instant,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let query = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(query)?;
        Ok(UncheckedTransaction {
            conn,
            started_at: Instant::now(),
        })
    }

    /// Consumes and commits the transaction.
    pub fn commit(self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        log::trace!("transaction committed after {:?}", self.started_at.elapsed());
        Ok(())
    }

    /// Consumes and rolls back the transaction.
    pub fn rollback(self) -> SqlResult<()> {
        self.rollback_()
    }

    fn rollback_(&self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.rollback_() {
                log::warn!("error dropping an unchecked transaction: {}", e);
            }
        }
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}
