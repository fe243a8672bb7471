use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SCHEMA_VERSION: i64 = 1;

/// Shared SQLite handle used by the decision log and the statistics store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {db_path}"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS karma_meta (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS karma_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                path TEXT NOT NULL,
                author TEXT NOT NULL,
                authenticated INTEGER NOT NULL DEFAULT 0,
                ipnr TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                rejected INTEGER NOT NULL DEFAULT 0,
                karma INTEGER NOT NULL DEFAULT 0,
                reasons TEXT,
                request TEXT
            );
            CREATE INDEX IF NOT EXISTS karma_log_time_idx ON karma_log (time);
            CREATE INDEX IF NOT EXISTS karma_log_path_idx ON karma_log (path);
            CREATE TABLE IF NOT EXISTS karma_statistics (
                strategy TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL,
                delay REAL NOT NULL,
                delay_max REAL NOT NULL,
                delay_min REAL NOT NULL,
                count INTEGER NOT NULL,
                external INTEGER,
                time INTEGER NOT NULL,
                PRIMARY KEY (strategy, action, data, status)
            );",
        )
        .context("Failed to create karma-filter tables")?;

        conn.execute(
            "INSERT OR IGNORE INTO karma_meta (name, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM karma_meta WHERE name = 'schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&mut conn)
    }
}
