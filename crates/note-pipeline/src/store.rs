//! Durable report store backed by a single-file SQLite database.
//!
//! All writes go through one `Mutex<Connection>`; readers see committed
//! snapshots. Rows move PENDING → SENT exactly once and are never deleted.
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that
//! `ORDER BY created_at` is chronological.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::policy;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reports (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id        TEXT NOT NULL UNIQUE,
    origin          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    lat             REAL NOT NULL,
    lon             REAL NOT NULL,
    text_original   TEXT NOT NULL,
    text_normalized TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'PENDING',
    upstream_id     INTEGER,
    upstream_url    TEXT,
    sent_at         TEXT,
    last_error      TEXT,
    notified_sent   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_reports_status_created ON reports(status, created_at);
CREATE INDEX IF NOT EXISTS idx_reports_origin_text ON reports(origin, text_normalized);
CREATE TABLE IF NOT EXISTS system_state (
    id                       INTEGER PRIMARY KEY CHECK (id = 1),
    boot_wallclock           TEXT NOT NULL,
    time_correction_applied  INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Pending,
    Sent,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "PENDING",
            ReportStatus::Sent => "SENT",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ReportStatus::Pending),
            "SENT" => Some(ReportStatus::Sent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub id: i64,
    pub queue_id: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub text_original: String,
    pub text_normalized: String,
    pub status: ReportStatus,
    pub upstream_id: Option<i64>,
    pub upstream_url: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub notified_sent: bool,
}

#[derive(Debug, Clone)]
pub struct SystemState {
    pub boot_wallclock: DateTime<Utc>,
    pub time_correction_applied: bool,
}

pub struct Store {
    conn: Mutex<Connection>,
}

const REPORT_COLUMNS: &str = "id, queue_id, origin, created_at, lat, lon, text_original, \
     text_normalized, status, upstream_id, upstream_url, sent_at, last_error, notified_sent";

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        Self::init(conn)
    }

    /// Read-only handle for inspection commands. Never creates the file and
    /// never touches the schema.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .with_context(|| format!("failed to open database at {}", path.display()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set database pragmas")?;
        conn.execute_batch(SCHEMA).context("failed to create schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert an accepted report. Assigns the monotonic id and mints the
    /// human-readable queue id (`Q-` + zero-padded id, natural width past 9999).
    pub fn append(
        &self,
        origin: &str,
        lat: f64,
        lon: f64,
        text_original: &str,
        text_normalized: &str,
        created_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO reports (queue_id, origin, created_at, lat, lon, text_original, text_normalized, status)
             VALUES ('', ?1, ?2, ?3, ?4, ?5, ?6, 'PENDING')",
            params![origin, fmt_ts(created_at), lat, lon, text_original, text_normalized],
        )
        .context("failed to insert report")?;
        let id = tx.last_insert_rowid();
        let queue_id = format!("Q-{:04}", id);
        tx.execute(
            "UPDATE reports SET queue_id = ?1 WHERE id = ?2",
            params![queue_id, id],
        )
        .context("failed to assign queue id")?;
        tx.commit().context("failed to commit report")?;
        Ok(queue_id)
    }

    /// Transition PENDING → SENT. Errors if the row is missing or already SENT.
    pub fn mark_sent(
        &self,
        queue_id: &str,
        upstream_id: i64,
        upstream_url: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute(
                "UPDATE reports
                 SET status = 'SENT', upstream_id = ?1, upstream_url = ?2, sent_at = ?3, last_error = NULL
                 WHERE queue_id = ?4 AND status = 'PENDING'",
                params![upstream_id, upstream_url, fmt_ts(sent_at), queue_id],
            )
            .context("failed to mark report sent")?;
        if changed != 1 {
            bail!("report {queue_id} is not PENDING");
        }
        Ok(())
    }

    /// Record the tag of the last failed upstream attempt. No state change.
    pub fn record_error(&self, queue_id: &str, tag: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE reports SET last_error = ?1 WHERE queue_id = ?2",
            params![tag, queue_id],
        )
        .context("failed to record error")?;
        Ok(())
    }

    /// Return the queue id of an existing row matching the dedup key:
    /// same origin, same normalized text, same position rounded to 4 decimals,
    /// same 120 s bucket.
    pub fn find_duplicate(
        &self,
        origin: &str,
        text_normalized: &str,
        lat_r: f64,
        lon_r: f64,
        bucket: i64,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT queue_id, lat, lon, created_at FROM reports
                 WHERE origin = ?1 AND text_normalized = ?2",
            )
            .context("failed to prepare duplicate query")?;
        let rows = stmt
            .query_map(params![origin, text_normalized], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to query duplicates")?;
        for row in rows {
            let (queue_id, lat, lon, created_at) = row.context("bad duplicate row")?;
            let created_at = parse_ts(&created_at)?;
            if policy::round4(lat) == lat_r
                && policy::round4(lon) == lon_r
                && policy::dedup_bucket(created_at) == bucket
            {
                return Ok(Some(queue_id));
            }
        }
        Ok(None)
    }

    /// Oldest-first page of PENDING rows for the flush worker.
    pub fn pending_page(&self, limit: usize) -> Result<Vec<Report>> {
        self.query_reports(
            &format!(
                "SELECT {REPORT_COLUMNS} FROM reports
                 WHERE status = 'PENDING' ORDER BY created_at, id LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Ids of PENDING rows stamped before the cutoff; input to the one-shot
    /// clock-skew correction.
    pub fn pending_ids_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT id FROM reports WHERE status = 'PENDING' AND created_at < ?1")
            .context("failed to prepare pending-ids query")?;
        let ids = stmt
            .query_map(params![fmt_ts(cutoff)], |row| row.get::<_, i64>(0))
            .context("failed to query pending ids")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("bad pending id row")?;
        Ok(ids)
    }

    /// Atomically shift `created_at` of the given rows by `delta`.
    /// Used once per boot; SENT rows are never passed in.
    pub fn shift_created_at(&self, ids: &[i64], delta: chrono::Duration) -> Result<usize> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction().context("failed to start shift transaction")?;
        let mut shifted = 0;
        {
            let mut select = tx
                .prepare("SELECT created_at FROM reports WHERE id = ?1 AND status = 'PENDING'")
                .context("failed to prepare shift select")?;
            let mut update = tx
                .prepare("UPDATE reports SET created_at = ?1 WHERE id = ?2")
                .context("failed to prepare shift update")?;
            for &id in ids {
                let created_at: Option<String> = select
                    .query_row(params![id], |row| row.get(0))
                    .optional()
                    .context("failed to read row for shift")?;
                if let Some(created_at) = created_at {
                    let shifted_ts = parse_ts(&created_at)? + delta;
                    update
                        .execute(params![fmt_ts(shifted_ts), id])
                        .context("failed to shift row")?;
                    shifted += 1;
                }
            }
        }
        tx.commit().context("failed to commit shift")?;
        Ok(shifted)
    }

    pub fn count_total(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM reports", [], |row| row.get(0))
            .context("failed to count reports")?;
        Ok(n as u64)
    }

    /// Rows created at or after the cutoff ("today" in the display timezone).
    pub fn count_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reports WHERE created_at >= ?1",
                params![fmt_ts(cutoff)],
                |row| row.get(0),
            )
            .context("failed to count recent reports")?;
        Ok(n as u64)
    }

    /// Newest-first listing for `#osmlist`.
    pub fn recent(&self, limit: usize) -> Result<Vec<Report>> {
        self.query_reports(
            &format!(
                "SELECT {REPORT_COLUMNS} FROM reports ORDER BY created_at DESC, id DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// PENDING depth and the oldest pending timestamp, for `#osmqueue`.
    pub fn pending_depth(&self) -> Result<(u64, Option<DateTime<Utc>>)> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let (n, oldest): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), MIN(created_at) FROM reports WHERE status = 'PENDING'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to read queue depth")?;
        let oldest = oldest.as_deref().map(parse_ts).transpose()?;
        Ok((n as u64, oldest))
    }

    /// How many of the origin's reports have reached SENT. Drives the
    /// every-5th-report privacy suffix.
    pub fn sent_count(&self, origin: &str) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reports WHERE origin = ?1 AND status = 'SENT'",
                params![origin],
                |row| row.get(0),
            )
            .context("failed to count sent reports")?;
        Ok(n as u64)
    }

    /// SENT rows whose origin has not yet been told about the promotion.
    pub fn unannounced_sent(&self) -> Result<Vec<Report>> {
        self.query_reports(
            &format!(
                "SELECT {REPORT_COLUMNS} FROM reports
                 WHERE status = 'SENT' AND notified_sent = 0 ORDER BY id"
            ),
            [],
        )
    }

    /// Latch the announcement flag so a row is announced at most once.
    pub fn mark_announced(&self, queue_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE reports SET notified_sent = 1 WHERE queue_id = ?1",
            params![queue_id],
        )
        .context("failed to mark report announced")?;
        Ok(())
    }

    /// Record this boot's wall-clock reading and reset the one-shot
    /// correction latch.
    pub fn init_boot_state(&self, boot_wallclock: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO system_state (id, boot_wallclock, time_correction_applied)
             VALUES (1, ?1, 0)",
            params![fmt_ts(boot_wallclock)],
        )
        .context("failed to record boot state")?;
        Ok(())
    }

    pub fn system_state(&self) -> Result<SystemState> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let (boot, applied): (String, i64) = conn
            .query_row(
                "SELECT boot_wallclock, time_correction_applied FROM system_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("system state missing; init_boot_state not called")?;
        Ok(SystemState {
            boot_wallclock: parse_ts(&boot)?,
            time_correction_applied: applied != 0,
        })
    }

    pub fn set_time_correction_applied(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE system_state SET time_correction_applied = 1 WHERE id = 1",
            [],
        )
        .context("failed to latch time correction")?;
        Ok(())
    }

    fn query_reports<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Report>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(sql).context("failed to prepare report query")?;
        let rows = stmt
            .query_map(params, report_from_row)
            .context("failed to query reports")?
            .collect::<rusqlite::Result<Vec<Report>>>()
            .context("bad report row")?;
        Ok(rows)
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in store: {s}"))
}

fn report_from_row(row: &Row) -> rusqlite::Result<Report> {
    let created_at: String = row.get(3)?;
    let status: String = row.get(8)?;
    let sent_at: Option<String> = row.get(11)?;
    Ok(Report {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        origin: row.get(2)?,
        created_at: sql_ts(3, &created_at)?,
        lat: row.get(4)?,
        lon: row.get(5)?,
        text_original: row.get(6)?,
        text_normalized: row.get(7)?,
        status: ReportStatus::from_str(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                format!("unknown status {status}").into(),
            )
        })?,
        upstream_id: row.get(9)?,
        upstream_url: row.get(10)?,
        sent_at: sent_at.as_deref().map(|s| sql_ts(11, s)).transpose()?,
        last_error: row.get(12)?,
        notified_sent: row.get::<_, i64>(13)? != 0,
    })
}

fn sql_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
