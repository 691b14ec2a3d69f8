//! SQLite connection management with WAL mode
//!
//! A single connection guarded by a mutex: the relational log is
//! append-heavy and every append must be serialized anyway.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::{RelayError, Result};

/// File name used inside the temporary directory of an ephemeral log
const EPHEMERAL_FILE: &str = "fsrelay.db";

/// SQLite database holding one or more event tables
pub struct Storage {
    db_path: PathBuf,
    table: String,
    conn: Arc<Mutex<Connection>>,
    /// Keeps the directory of an ephemeral database alive
    tempdir: Option<Arc<tempfile::TempDir>>,
}

impl Storage {
    /// Open or create the database at `path` and migrate `table`
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let db_path = path.as_ref().to_path_buf();
        let conn = Self::create_connection(&db_path)?;
        run_migrations(&conn, table)?;

        Ok(Self {
            db_path,
            table: table.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            tempdir: None,
        })
    }

    /// Open a database in a fresh temporary directory, removed on drop
    pub fn open_ephemeral(table: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("fsrelay-").tempdir()?;
        let mut storage = Self::open(dir.path().join(EPHEMERAL_FILE), table)?;
        tracing::debug!(path = %storage.db_path.display(), "opened ephemeral relational log");
        storage.tempdir = Some(Arc::new(dir));
        Ok(storage)
    }

    fn create_connection(path: &Path) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(path, flags)?;
        Self::configure_pragmas(&conn)?;
        Ok(conn)
    }

    /// WAL for concurrent readers while the dispatcher appends
    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA wal_autocheckpoint=1000;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-16000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Event table name
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_ephemeral(&self) -> bool {
        self.tempdir.is_some()
    }

    /// Checkpoint the WAL into the main database file
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            table: self.table.clone(),
            conn: self.conn.clone(),
            tempdir: self.tempdir.clone(),
        }
    }
}

/// Table names are interpolated into SQL, so only identifiers are accepted
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RelayError::Config(format!(
            "invalid relational table name: {:?}",
            name
        )))
    }
}
