//! RevDB Database Module
//! SQLite connection pool, collation registration and the single-writer
//! transaction used by every mutating operation

use parking_lot::ReentrantMutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::collate;
use super::config::DatabaseConfig;
use super::migrations::MigrationRunner;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Transaction rolled back after a nested failure")]
    RolledBack,
}

pub struct Database {
    pool: DbPool,
    path: Option<PathBuf>,
    /// Held by the writing thread; the slot carries its open transaction so
    /// that writes and reads issued again on that thread join it
    writer: ReentrantMutex<RefCell<Option<ActiveWrite>>>,
}

impl Database {
    pub fn new(db_path: &Path, config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            init_connection(conn)
        });
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .build(manager)?;

        let db = Self {
            pool,
            path: Some(db_path.to_path_buf()),
            writer: ReentrantMutex::new(RefCell::new(None)),
        };
        db.init_schema(true)?;
        Ok(db)
    }

    /// A private in-memory database. The pool holds a single connection, so
    /// every reader and the writer share it.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        // Recycling the connection would discard the database
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;
        let db = Self {
            pool,
            path: None,
            writer: ReentrantMutex::new(RefCell::new(None)),
        };
        db.init_schema(false)?;
        Ok(db)
    }

    fn init_schema(&self, wal: bool) -> Result<(), DatabaseError> {
        let conn = self.pool.get()?;

        if wal {
            // Readers keep working while the writer holds its transaction
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON")?;

        let applied = MigrationRunner::new()
            .push(&conn)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        if !applied.is_empty() {
            debug!(migrations = ?applied, "applied schema migrations");
        }
        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against a connection. On a thread that is inside `write`, that
    /// is the open transaction's connection, so uncommitted rows are visible.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        // Only succeeds while another thread is not writing
        if let Some(slot) = self.writer.try_lock() {
            let open = slot.borrow();
            if let Some(active) = open.as_ref() {
                return f(&active.conn);
            }
        }
        let conn = self.get_connection()?;
        f(&conn)
    }

    /// Run `f` inside the store's exclusive write transaction.
    ///
    /// Called again on a thread that already writes, `f` runs as a nested
    /// scope of the open transaction. Only the outermost call commits, and
    /// only if `f` succeeded and no nested scope failed; otherwise the whole
    /// transaction is rolled back.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTxn<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let slot = self.writer.lock();
        let outermost = slot.borrow().is_none();
        let open = if outermost {
            Some(OpenWrite::begin(&slot, self.get_connection()?)?)
        } else {
            None
        };

        let result = match slot.borrow().as_ref() {
            Some(active) if outermost => f(&active.txn()),
            Some(active) => {
                let txn = active.txn();
                txn.nested(|| f(&txn))
            }
            None => Err(DatabaseError::RolledBack.into()),
        };

        match open {
            Some(open) => open.finish(result),
            None => result,
        }
    }

    /// Reclaim free pages. Skipped when the calling thread is inside a write,
    /// since VACUUM cannot run in a transaction.
    pub fn vacuum(&self) -> Result<(), DatabaseError> {
        let slot = self.writer.lock();
        if slot.borrow().is_some() {
            debug!("skipping VACUUM inside an open write transaction");
            return Ok(());
        }
        let conn = self.get_connection()?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

fn init_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    collate::register_collations(conn)?;
    conn.execute_batch("PRAGMA foreign_keys=ON")
}

struct ActiveWrite {
    conn: DbConnection,
    depth: Cell<u32>,
    failed: Cell<bool>,
}

impl ActiveWrite {
    fn txn(&self) -> WriteTxn<'_> {
        WriteTxn {
            conn: &self.conn,
            depth: &self.depth,
            failed: &self.failed,
        }
    }
}

/// The outermost write's claim on the slot. Dropped without `finish`, as when
/// the closure panics, it rolls the transaction back.
struct OpenWrite<'s> {
    slot: &'s RefCell<Option<ActiveWrite>>,
}

impl<'s> OpenWrite<'s> {
    fn begin(slot: &'s RefCell<Option<ActiveWrite>>, conn: DbConnection) -> Result<Self, DatabaseError> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        *slot.borrow_mut() = Some(ActiveWrite {
            conn,
            depth: Cell::new(1),
            failed: Cell::new(false),
        });
        Ok(Self { slot })
    }

    fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<DatabaseError>,
    {
        let Some(active) = self.slot.borrow_mut().take() else {
            return Err(DatabaseError::RolledBack.into());
        };
        match result {
            Ok(value) if !active.failed.get() => match active.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(err) => {
                    rollback(&active.conn);
                    Err(DatabaseError::from(err).into())
                }
            },
            Ok(_) => {
                warn!("rolling back transaction marked as failed by a nested scope");
                rollback(&active.conn);
                Err(DatabaseError::RolledBack.into())
            }
            Err(err) => {
                rollback(&active.conn);
                Err(err)
            }
        }
    }
}

impl Drop for OpenWrite<'_> {
    fn drop(&mut self) {
        let Ok(mut slot) = self.slot.try_borrow_mut() else {
            return;
        };
        if let Some(active) = slot.take() {
            warn!("write transaction abandoned, rolling back");
            rollback(&active.conn);
        }
    }
}

fn rollback(conn: &Connection) {
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(error = %err, "rollback failed");
    }
}

/// Handle to the open write transaction.
///
/// Dereferences to the underlying connection so statements run inside the
/// transaction. Scopes nest by depth count; only the outermost
/// `Database::write` commits.
pub struct WriteTxn<'c> {
    conn: &'c Connection,
    depth: &'c Cell<u32>,
    failed: &'c Cell<bool>,
}

impl<'c> WriteTxn<'c> {
    /// Run `f` as a nested scope. An error marks the outer transaction for
    /// rollback even if the caller recovers from it.
    pub fn nested<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.depth.set(self.depth.get() + 1);
        let result = f();
        self.depth.set(self.depth.get() - 1);
        if result.is_err() {
            self.failed.set(true);
        }
        result
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.get()
    }

    pub fn set_failed(&self) {
        self.failed.set(true);
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }
}

impl Deref for WriteTxn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}
