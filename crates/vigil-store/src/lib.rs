//! vigil-store — SQLite persistence for presence sessions.
//!
//! Sessions are append-only: one row per closed presence interval, many
//! rows per identity.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;
use vigil_core::{PersistenceError, PersistenceStore, SessionRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt row {rowid}: {reason}")]
    Corrupt { rowid: i64, reason: String },
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        PersistenceError::Backend(Box::new(e))
    }
}

/// Number of sessions recorded for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySummary {
    pub identity_id: Uuid,
    pub sessions: u64,
    pub total_secs: u64,
    pub last_departure: DateTime<Utc>,
}

/// Default database location: `$XDG_DATA_HOME/vigil/sessions.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
        .join("sessions.db")
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::info!(path = %path.display(), "session store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id   TEXT NOT NULL,
                arrival       TEXT NOT NULL,
                departure     TEXT NOT NULL,
                duration_secs INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_identity ON sessions(identity_id);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO sessions (identity_id, arrival, departure, duration_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity_id.to_string(),
                record.arrival.to_rfc3339_opts(SecondsFormat::Micros, true),
                record.departure.to_rfc3339_opts(SecondsFormat::Micros, true),
                record.duration_secs as i64,
            ],
        )?;
        tracing::debug!(id = %record.identity_id, duration_secs = record.duration_secs, "session stored");
        Ok(())
    }

    /// Sessions for one identity, in insertion order.
    pub fn sessions(&self, identity_id: Uuid) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, arrival, departure, duration_secs
             FROM sessions WHERE identity_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![identity_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (rowid, id, arrival, departure, duration) = row?;
            records.push(SessionRecord {
                identity_id: parse_uuid(rowid, &id)?,
                arrival: parse_time(rowid, &arrival)?,
                departure: parse_time(rowid, &departure)?,
                duration_secs: duration.max(0) as u64,
            });
        }
        Ok(records)
    }

    /// Per-identity session counts, most recently departed first.
    pub fn identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, COUNT(*), SUM(duration_secs), MAX(departure), MIN(id)
             FROM sessions GROUP BY identity_id ORDER BY MAX(departure) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, sessions, total, last, rowid) = row?;
            summaries.push(IdentitySummary {
                identity_id: parse_uuid(rowid, &id)?,
                sessions: sessions.max(0) as u64,
                total_secs: total.max(0) as u64,
                last_departure: parse_time(rowid, &last)?,
            });
        }
        Ok(summaries)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl PersistenceStore for SqliteSessionStore {
    fn append(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        Ok(self.insert(record)?)
    }

    fn records_for(&self, identity_id: Uuid) -> Result<Vec<SessionRecord>, PersistenceError> {
        Ok(self.sessions(identity_id)?)
    }
}

fn parse_uuid(rowid: i64, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        rowid,
        reason: format!("identity id {raw:?}: {e}"),
    })
}

fn parse_time(rowid: i64, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            rowid,
            reason: format!("timestamp {raw:?}: {e}"),
        })
}
