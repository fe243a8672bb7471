use crate::database::Database;
use crate::model::{
    decode_content, decode_reasons, decode_request, encode_content, encode_reasons,
    encode_request, LogEntry,
};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const COLUMNS: &str = "id, time, path, author, authenticated, ipnr, headers, \
                       content, rejected, karma, reasons, request";

/// Window around a ticket's creation time in which `/newticket` submissions
/// are considered related to it.
const NEW_TICKET_WINDOW_SECS: i64 = 30;

/// Optional restrictions for `DecisionLog::select`.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    pub ip: Option<String>,
    pub author: Option<String>,
    pub rejected: Option<bool>,
}

/// Append-only record of evaluated submissions.
///
/// Entries are only ever re-labeled (`set_rejected`), purged or deleted.
#[derive(Clone)]
pub struct DecisionLog {
    db: Database,
}

impl DecisionLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a new entry and assign its id.
    pub fn insert(&self, entry: &mut LogEntry) -> Result<i64> {
        if entry.exists() {
            bail!("Cannot insert existing log entry {:?}", entry.id);
        }

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO karma_log
                    (time, path, author, authenticated, ipnr, headers, content,
                     rejected, karma, reasons, request)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.time.timestamp(),
                    entry.path,
                    entry.author,
                    entry.authenticated,
                    entry.ip,
                    entry.headers,
                    encode_content(&entry.content),
                    entry.rejected,
                    entry.karma,
                    encode_reasons(&entry.reasons),
                    encode_request(entry.request.as_ref()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        entry.id = Some(id);
        Ok(id)
    }

    pub fn fetch(&self, id: i64) -> Result<Option<LogEntry>> {
        self.db.with_conn(|conn| {
            let entry = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM karma_log WHERE id = ?1"),
                    params![id],
                    Self::from_row,
                )
                .optional()?;
            Ok(entry)
        })
    }

    /// Newest first. `limit` of `None` returns everything after `offset`.
    pub fn select(
        &self,
        filter: &LogFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(ip) = &filter.ip {
            clauses.push("ipnr = ?".to_string());
            values.push(Value::Text(ip.clone()));
        }
        if let Some(author) = &filter.author {
            clauses.push("author = ?".to_string());
            values.push(Value::Text(author.clone()));
        }
        if let Some(rejected) = filter.rejected {
            clauses.push("rejected = ?".to_string());
            values.push(Value::Integer(rejected as i64));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        self.query(&where_clause, values, limit, offset)
    }

    /// Entries sharing a logical target with `descriptor` (`path[#unix_time]`).
    ///
    /// For tickets, submissions to `/newticket` close to the given creation
    /// time are included too, since that is where the ticket came from.
    pub fn find_related(
        &self,
        descriptor: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<LogEntry>> {
        let (path, time) = match descriptor.split_once('#') {
            Some((path, time)) => (path, time.trim().parse::<i64>().ok()),
            None => (descriptor, None),
        };

        let mut clauses = vec!["path = ?".to_string()];
        let mut values = vec![Value::Text(path.to_string())];

        if let (true, Some(time)) = (path.starts_with("/ticket/"), time) {
            clauses.push("(path = '/newticket' AND time BETWEEN ? AND ?)".to_string());
            values.push(Value::Integer(time - NEW_TICKET_WINDOW_SECS));
            values.push(Value::Integer(time + NEW_TICKET_WINDOW_SECS));
        }

        let where_clause = format!("WHERE {}", clauses.join(" OR "));
        self.query(&where_clause, values, limit, offset)
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM karma_log", [], |row| row.get(0))?)
        })
    }

    /// The next older entry in reverse chronological order.
    pub fn next_older(&self, id: i64) -> Result<Option<LogEntry>> {
        self.neighbour("id < ?1 ORDER BY id DESC", id)
    }

    /// The next younger entry in reverse chronological order.
    pub fn next_newer(&self, id: i64) -> Result<Option<LogEntry>> {
        self.neighbour("id > ?1 ORDER BY id ASC", id)
    }

    /// Re-label an entry. Returns false if no such entry exists.
    pub fn set_rejected(&self, id: i64, rejected: bool) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE karma_log SET rejected = ?1 WHERE id = ?2",
                params![rejected, id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete entries older than `days` days. Returns the number removed.
    ///
    /// An age reaching back past the earliest representable time removes nothing.
    pub fn purge(&self, days: u32) -> Result<usize> {
        match Duration::try_days(i64::from(days)).and_then(|age| Utc::now().checked_sub_signed(age)) {
            Some(threshold) => self.purge_before(threshold),
            None => Ok(0),
        }
    }

    pub fn purge_before(&self, threshold: DateTime<Utc>) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM karma_log WHERE time < ?1",
                params![threshold.timestamp()],
            )?)
        })?;
        if removed > 0 {
            log::info!("Purged {removed} decision log entries older than {threshold}");
        }
        Ok(removed)
    }

    pub fn delete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                &format!("DELETE FROM karma_log WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?)
        })
    }

    /// Ids of unauthenticated rejected entries where `strategy` reported a
    /// confidence (its first reason argument) above `threshold`.
    pub fn find_obvious(&self, strategy: &str, threshold: f64) -> Result<Vec<i64>> {
        let rows: Vec<(i64, Option<String>)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, reasons FROM karma_log
                 WHERE authenticated = 0 AND rejected = 1
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter(|(_, reasons)| {
                decode_reasons(reasons.as_deref()).iter().any(|r| {
                    r.strategy == strategy
                        && r.args
                            .first()
                            .and_then(|a| a.trim().trim_end_matches('%').parse::<f64>().ok())
                            .is_some_and(|v| v > threshold)
                })
            })
            .map(|(id, _)| id)
            .collect())
    }

    fn neighbour(&self, clause: &str, id: i64) -> Result<Option<LogEntry>> {
        self.db.with_conn(|conn| {
            let entry = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM karma_log WHERE {clause} LIMIT 1"),
                    params![id],
                    Self::from_row,
                )
                .optional()?;
            Ok(entry)
        })
    }

    fn query(
        &self,
        where_clause: &str,
        mut values: Vec<Value>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut sql = format!("SELECT {COLUMNS} FROM karma_log {where_clause} ORDER BY time DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(limit as i64));
            values.push(Value::Integer(offset as i64));
        } else if offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            values.push(Value::Integer(offset as i64));
        }

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values.iter()), Self::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
        let time = timestamp(row.get(1)?);
        let content: String = row.get(7)?;
        let reasons: Option<String> = row.get(10)?;
        let request: Option<String> = row.get(11)?;

        Ok(LogEntry {
            id: Some(row.get(0)?),
            time: DateTime::from_timestamp(time, 0).unwrap_or_default(),
            path: row.get(2)?,
            author: row.get(3)?,
            authenticated: row.get(4)?,
            ip: row.get(5)?,
            headers: row.get(6)?,
            content: decode_content(&content),
            rejected: row.get(8)?,
            karma: row.get(9)?,
            reasons: decode_reasons(reasons.as_deref()),
            request: decode_request(request.as_deref()),
        })
    }
}

/// Unix seconds from a stored `time` cell; unreadable values become the epoch.
fn timestamp(value: Value) -> i64 {
    match value {
        Value::Integer(t) => t,
        Value::Real(t) => t as i64,
        Value::Text(t) => t.trim().parse::<f64>().map(|t| t as i64).unwrap_or_default(),
        Value::Null | Value::Blob(_) => 0,
    }
}
