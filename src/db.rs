//! SQLite storage for site records and the site action log
//!
//! Row-level helpers take a `&Connection` so callers can compose several of
//! them inside one [`Database::transaction`].

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL for concurrent readers; foreign keys for ON DELETE SET NULL on logs
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Run `f` inside a transaction, committing only if it returns `Ok`
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run read-only queries against the connection
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Migration v1: sites and logs
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: sites and logs");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            domain TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
            document_root TEXT NOT NULL,
            database_name TEXT,
            ssl_enabled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER REFERENCES sites(id) ON DELETE SET NULL,
            action TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_logs_site ON logs(site_id);
        CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

// ==================== Record Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Active,
    Inactive,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Active => "active",
            SiteStatus::Inactive => "inactive",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            SiteStatus::Active => SiteStatus::Inactive,
            SiteStatus::Inactive => SiteStatus::Active,
        }
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SiteStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SiteStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "active" => Ok(SiteStatus::Active),
            "inactive" => Ok(SiteStatus::Inactive),
            other => Err(FromSqlError::Other(format!("unknown site status '{}'", other).into())),
        }
    }
}

/// Site record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub status: SiteStatus,
    pub document_root: String,
    pub database_name: Option<String>,
    pub ssl_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Site {
    pub fn is_active(&self) -> bool {
        self.status == SiteStatus::Active
    }
}

/// Column values for a new site row
#[derive(Debug, Clone)]
pub struct SiteInsert<'a> {
    pub name: &'a str,
    pub domain: &'a str,
    pub document_root: &'a str,
    pub database_name: Option<&'a str>,
    pub ssl_enabled: bool,
}

/// Site action log record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub site_id: Option<i64>,
    pub action: String,
    pub details: String,
    pub timestamp: String,
}

const SITE_COLUMNS: &str =
    "id, name, domain, status, document_root, database_name, ssl_enabled, created_at, updated_at";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        status: row.get(3)?,
        document_root: row.get(4)?,
        database_name: row.get(5)?,
        ssl_enabled: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ==================== Site Operations ====================

pub fn insert_site(conn: &Connection, site: &SiteInsert<'_>, now: &str) -> rusqlite::Result<Site> {
    conn.execute(
        "INSERT INTO sites (name, domain, status, document_root, database_name, ssl_enabled,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            site.name,
            site.domain,
            SiteStatus::Active,
            site.document_root,
            site.database_name,
            site.ssl_enabled,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_site(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn find_site(conn: &Connection, id: i64) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        &format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS),
        params![id],
        site_from_row,
    )
    .optional()
}

pub fn find_site_by_domain(conn: &Connection, domain: &str) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        &format!("SELECT {} FROM sites WHERE domain = ?1", SITE_COLUMNS),
        params![domain],
        site_from_row,
    )
    .optional()
}

/// All sites ordered by id
pub fn list_sites(conn: &Connection) -> rusqlite::Result<Vec<Site>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM sites ORDER BY id ASC", SITE_COLUMNS))?;
    let sites = stmt
        .query_map([], site_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sites)
}

pub fn update_site_status(
    conn: &Connection,
    id: i64,
    status: SiteStatus,
    now: &str,
) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE sites SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now, id],
    )?;
    Ok(rows > 0)
}

pub fn delete_site(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let rows = conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ==================== Log Operations ====================

pub fn insert_log(
    conn: &Connection,
    site_id: Option<i64>,
    action: &str,
    details: &str,
    now: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO logs (site_id, action, details, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![site_id, action, details, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent log entries, newest first
pub fn recent_logs(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, site_id, action, details, timestamp
         FROM logs ORDER BY id DESC LIMIT ?1",
    )?;
    let entries = stmt
        .query_map(params![limit as i64], |row| {
            Ok(LogEntry {
                id: row.get(0)?,
                site_id: row.get(1)?,
                action: row.get(2)?,
                details: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Whether an error is a UNIQUE constraint violation
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
