//! RevDB Migrations Module
//! Embedded schema migrations, applied in order and recorded in a journal
//! with their checksums

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Schema drift detected: {0}")]
    SchemaDrift(String),
    #[error("SQL execution error: {0}")]
    SqlError(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        let result = hasher.finalize();
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result)
    }
}

const JOURNAL: &str = "CREATE TABLE IF NOT EXISTS _revdb_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL,
    checksum TEXT NOT NULL
)";

/// Core document, revision, view and attachment tables
const INITIAL_SCHEMA: &str = "
    CREATE TABLE docs (
        doc_id INTEGER PRIMARY KEY,
        docid TEXT UNIQUE NOT NULL);
    CREATE INDEX docs_docid ON docs(docid);
    CREATE TABLE revs (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        doc_id INTEGER NOT NULL REFERENCES docs(doc_id) ON DELETE CASCADE,
        revid TEXT NOT NULL COLLATE REVID,
        parent INTEGER REFERENCES revs(sequence) ON DELETE SET NULL,
        current BOOLEAN,
        deleted BOOLEAN DEFAULT 0,
        json BLOB);
    CREATE INDEX revs_by_id ON revs(revid, doc_id);
    CREATE INDEX revs_current ON revs(doc_id, current);
    CREATE INDEX revs_parent ON revs(parent);
    CREATE TABLE views (
        view_id INTEGER PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        version TEXT,
        lastsequence INTEGER DEFAULT 0);
    CREATE INDEX views_by_name ON views(name);
    CREATE TABLE maps (
        view_id INTEGER NOT NULL REFERENCES views(view_id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
        key TEXT NOT NULL COLLATE JSON,
        value TEXT);
    CREATE INDEX maps_keys ON maps(view_id, key COLLATE JSON);
    CREATE INDEX maps_sequence ON maps(view_id, sequence);
    CREATE TABLE attachments (
        sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        key BLOB NOT NULL,
        type TEXT,
        length INTEGER NOT NULL);
    CREATE INDEX attachments_by_sequence ON attachments(sequence, filename);
";

/// Per-remote replication checkpoints
const REPLICATORS: &str = "
    CREATE TABLE replicators (
        remote TEXT NOT NULL,
        push BOOLEAN,
        last_sequence TEXT,
        UNIQUE (remote, push));
";

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_initial_schema",
        sql: INITIAL_SCHEMA,
    },
    Migration {
        name: "0002_replication_checkpoints",
        sql: REPLICATORS,
    },
];

pub struct MigrationRunner {
    migrations: &'static [Migration],
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self {
            migrations: MIGRATIONS,
        }
    }

    pub fn get_applied_migrations(&self, conn: &Connection) -> Result<Vec<String>, MigrationError> {
        conn.execute(JOURNAL, [])?;
        let mut stmt = conn.prepare("SELECT name FROM _revdb_migrations ORDER BY id")?;
        let migrations = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(migrations)
    }

    /// Verify applied migrations still match the embedded SQL
    pub fn check(&self, conn: &Connection) -> Result<MigrationStatus, MigrationError> {
        conn.execute(JOURNAL, [])?;
        let mut pending = Vec::new();
        let mut applied_count = 0;

        for migration in self.migrations {
            let recorded: Option<String> = conn
                .query_row(
                    "SELECT checksum FROM _revdb_migrations WHERE name = ?1",
                    [migration.name],
                    |row| row.get(0),
                )
                .optional()?;

            match recorded {
                Some(checksum) if checksum == migration.checksum() => applied_count += 1,
                Some(_) => return Err(MigrationError::SchemaDrift(migration.name.to_string())),
                None => pending.push(migration.name.to_string()),
            }
        }

        Ok(MigrationStatus {
            applied_count,
            pending_count: pending.len(),
            pending_migrations: pending,
        })
    }

    pub fn apply(&self, conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
        // Execute in a transaction
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO _revdb_migrations (name, applied_at, checksum) VALUES (?1, ?2, ?3)",
                params![migration.name, Utc::now().to_rfc3339(), migration.checksum()],
            )
        });

        match result {
            Ok(_) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", [])?;
                Err(MigrationError::SqlError(e))
            }
        }
    }

    /// Apply every pending migration, returning the names applied
    pub fn push(&self, conn: &Connection) -> Result<Vec<String>, MigrationError> {
        let status = self.check(conn)?;
        let mut applied = Vec::new();

        for migration in self.migrations {
            if status.pending_migrations.iter().any(|name| name == migration.name) {
                self.apply(conn, migration)?;
                applied.push(migration.name.to_string());
            }
        }

        Ok(applied)
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MigrationStatus {
    pub applied_count: usize,
    pub pending_count: usize,
    pub pending_migrations: Vec<String>,
}
