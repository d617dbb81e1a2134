use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("invalid date in ledger row: {0}")]
    InvalidDate(String),
    #[error("invalid time in ledger row: {0}")]
    InvalidTime(String),
}

/// One accepted attendance event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub evidence_ref: Option<String>,
}

/// SQLite-backed attendance ledger.
///
/// The uniqueness guarantee — at most one event per identity per calendar
/// date — lives in the storage layer as a `UNIQUE(identity, date)`
/// constraint. [`record`](Self::record) inserts with `OR IGNORE`, so a
/// duplicate attempt is absorbed and reported as `false` instead of relying
/// on a racy check-then-insert at the caller.
#[derive(Clone)]
pub struct AttendanceLedger {
    conn: Connection,
}

impl AttendanceLedger {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     identity TEXT NOT NULL,
                     date TEXT NOT NULL,
                     time TEXT NOT NULL,
                     evidence_ref TEXT,
                     UNIQUE(identity, date)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Whether an event already exists for this identity on this date.
    ///
    /// Retried once on a transient database error.
    pub async fn has_record_on(
        &self,
        identity: &str,
        date: NaiveDate,
    ) -> Result<bool, LedgerError> {
        match self.has_record_on_inner(identity, date).await {
            Ok(found) => Ok(found),
            Err(err) => {
                tracing::warn!(error = %err, identity, "ledger query failed — retrying once");
                self.has_record_on_inner(identity, date).await
            }
        }
    }

    async fn has_record_on_inner(
        &self,
        identity: &str,
        date: NaiveDate,
    ) -> Result<bool, LedgerError> {
        let identity = identity.to_string();
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE identity = ?1 AND date = ?2",
                    [&identity, &date],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(LedgerError::from)
    }

    /// Insert an attendance event. Returns `false` when the unique
    /// `(identity, date)` constraint absorbed a duplicate — the dedup
    /// signal, not an error.
    ///
    /// Retried once on a transient database error.
    pub async fn record(
        &self,
        identity: &str,
        date: NaiveDate,
        time: NaiveTime,
        evidence_ref: Option<&str>,
    ) -> Result<bool, LedgerError> {
        match self.record_inner(identity, date, time, evidence_ref).await {
            Ok(inserted) => Ok(inserted),
            Err(err) => {
                tracing::warn!(error = %err, identity, "ledger insert failed — retrying once");
                self.record_inner(identity, date, time, evidence_ref).await
            }
        }
    }

    async fn record_inner(
        &self,
        identity: &str,
        date: NaiveDate,
        time: NaiveTime,
        evidence_ref: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let identity = identity.to_string();
        let date = date.to_string();
        let time = time.format("%H:%M:%S").to_string();
        let evidence_ref = evidence_ref.map(str::to_string);

        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT OR IGNORE INTO attendance (id, identity, date, time, evidence_ref)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, identity, date, time, evidence_ref],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(LedgerError::from)
    }

    /// All events recorded on a date, ordered by time.
    pub async fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let date_str = date.to_string();
        let rows: Vec<(String, String, String, String, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity, date, time, evidence_ref
                     FROM attendance WHERE date = ?1 ORDER BY time, identity",
                )?;
                let rows = stmt.query_map([&date_str], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(id, identity, date, time, evidence_ref)| {
                Ok(AttendanceRecord {
                    id,
                    identity,
                    date: date
                        .parse()
                        .map_err(|_| LedgerError::InvalidDate(date.clone()))?,
                    time: NaiveTime::parse_from_str(&time, "%H:%M:%S")
                        .map_err(|_| LedgerError::InvalidTime(time.clone()))?,
                    evidence_ref,
                })
            })
            .collect()
    }

    /// Count all recorded events.
    pub async fn count(&self) -> Result<u64, LedgerError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(LedgerError::from)
    }
}
