//! SQLite persistence for the local machine registry.
//!
//! Machines are stored as a JSON settings blob plus a few queryable columns
//! (name, registered flag).

mod machines;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use ovfimport_shared::errors::{ImportError, ImportResult};

pub use machines::{MachineRecord, MachineStore};

/// Convert rusqlite errors to `ImportError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| ImportError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle, shared by the stores built on it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: &Path) -> ImportResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        // WAL for concurrent readers, FULL sync so a registered machine
        // survives a crash right after registration.
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=30000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests and throwaway registries.
    pub fn open_in_memory() -> ImportResult<Self> {
        let conn = db_err!(Connection::open_in_memory())?;
        db_err!(conn.execute_batch("PRAGMA foreign_keys=ON;"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> ImportResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::info!(
                    "Initialized registry schema version {}",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(ImportError::Database(format!(
                    "registry schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}
