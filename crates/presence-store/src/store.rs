//! SQLite-backed store for enrolled identities, sessions and attendance.
//!
//! All statements run on the single `tokio-rusqlite` connection thread, so
//! callers never block the async runtime on disk I/O.

use crate::error::StoreError;
use crate::migrations::run_migrations;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::{
    AttendanceRecord, Clock, Descriptor, EnrolledIdentity, Role, Session, SystemClock,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

pub(crate) const DATE_FMT: &str = "%Y-%m-%d";
pub(crate) const TIME_FMT: &str = "%H:%M:%S";
pub(crate) const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub(crate) const SESSION_COLUMNS: &str =
    "session_id, course_id, date, start_time, end_time, is_open";
pub(crate) const RECORD_COLUMNS: &str =
    "record_id, session_id, identity_id, status, confidence, recorded_at";
const IDENTITY_COLUMNS: &str = "identity_id, role, name, descriptor";

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: tokio_rusqlite::Connection,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "sqlite journal mode");
            Ok(())
        })
        .await?;

        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    /// Fresh in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(run_migrations(conn))
        })
        .await??;

        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for timestamps and window checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }

    // --- Enrollment ---

    /// Insert or replace an enrolled identity.
    pub async fn enroll(
        &self,
        identity_id: i64,
        role: Role,
        name: &str,
        descriptor: Option<Descriptor>,
    ) -> Result<EnrolledIdentity, StoreError> {
        let name = name.to_string();
        let stored_name = name.clone();
        let now = format_datetime(self.clock.now());
        let blob = descriptor.as_ref().map(Descriptor::to_le_bytes);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (identity_id, role, name, descriptor, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         role = excluded.role,
                         name = excluded.name,
                         descriptor = excluded.descriptor,
                         updated_at = excluded.updated_at",
                    params![identity_id, role.as_str(), stored_name, blob, now],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(identity_id, role = %role, "identity enrolled");

        Ok(EnrolledIdentity {
            identity_id,
            role,
            name,
            descriptor,
        })
    }

    /// Snapshot of enrolled identities, ordered by id.
    ///
    /// Rows with unreadable descriptor blobs come back with `descriptor: None`.
    pub async fn list_enrolled(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let identities = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities
                     WHERE (?1 IS NULL OR role = ?1)
                     ORDER BY identity_id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![role.map(|r| r.as_str())], row_to_identity)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    pub async fn get_identity(
        &self,
        identity_id: i64,
    ) -> Result<Option<EnrolledIdentity>, StoreError> {
        let identity = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE identity_id = ?1");
                Ok(conn
                    .query_row(&sql, params![identity_id], row_to_identity)
                    .optional()?)
            })
            .await?;
        Ok(identity)
    }

    /// Remove an identity and, by cascade, its attendance rows and samples.
    pub async fn delete_identity(&self, identity_id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM identities WHERE identity_id = ?1",
                    params![identity_id],
                )?)
            })
            .await?;
        if deleted > 0 {
            tracing::info!(identity_id, "identity deleted");
        }
        Ok(deleted > 0)
    }

    /// Number of learning samples stored for an identity.
    pub async fn count_learning_samples(&self, identity_id: i64) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM identity_embeddings WHERE identity_id = ?1",
                    params![identity_id],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // --- Sessions ---

    /// Open a new session. Times are copied from the course schedule by the caller.
    pub async fn start_session(
        &self,
        course_id: i64,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Session, StoreError> {
        if start_time >= end_time {
            return Err(StoreError::InvalidWindow {
                start: start_time.format(TIME_FMT).to_string(),
                end: end_time.format(TIME_FMT).to_string(),
            });
        }
        let created_at = format_datetime(self.clock.now());

        let session_id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (course_id, date, start_time, end_time, is_open, created_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![
                        course_id,
                        date.format(DATE_FMT).to_string(),
                        start_time.format(TIME_FMT).to_string(),
                        end_time.format(TIME_FMT).to_string(),
                        created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::info!(session_id, course_id, %date, %start_time, %end_time, "session started");

        Ok(Session {
            session_id,
            course_id,
            date,
            start_time,
            end_time,
            is_open: true,
        })
    }

    /// Close a session. Returns `false` if it does not exist.
    pub async fn end_session(&self, session_id: i64) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE sessions SET is_open = 0 WHERE session_id = ?1",
                    params![session_id],
                )?)
            })
            .await?;
        if updated > 0 {
            tracing::info!(session_id, "session ended");
        }
        Ok(updated > 0)
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>, StoreError> {
        let session = self
            .conn
            .call(move |conn| Ok(query_session(conn, session_id)?))
            .await?;
        Ok(session)
    }

    /// Remove a session and, by cascade, its attendance rows.
    pub async fn delete_session(&self, session_id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE session_id = ?1",
                    params![session_id],
                )?)
            })
            .await?;
        if deleted > 0 {
            tracing::info!(session_id, "session deleted");
        }
        Ok(deleted > 0)
    }

    // --- Attendance queries ---

    pub async fn find_attendance(
        &self,
        session_id: i64,
        identity_id: i64,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let record = self
            .conn
            .call(move |conn| Ok(query_attendance(conn, session_id, identity_id)?))
            .await?;
        Ok(record)
    }

    /// Records for a session, in recording order.
    pub async fn list_attendance(
        &self,
        session_id: i64,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM attendances WHERE session_id = ?1 ORDER BY record_id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![session_id], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    /// Records for one identity across sessions, newest first.
    pub async fn list_attendance_for_identity(
        &self,
        identity_id: i64,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM attendances WHERE identity_id = ?1
                     ORDER BY recorded_at DESC, record_id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![identity_id], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    /// Enrolled identities of `role` with no record for the session.
    pub async fn list_absent(
        &self,
        session_id: i64,
        role: Role,
    ) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let absent = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities i
                     WHERE i.role = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM attendances a
                           WHERE a.session_id = ?1 AND a.identity_id = i.identity_id
                       )
                     ORDER BY i.identity_id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![session_id, role.as_str()], row_to_identity)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(absent)
    }
}

// --- Row helpers ---

pub(crate) fn format_datetime(value: NaiveDateTime) -> String {
    value.format(DATETIME_FMT).to_string()
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn query_session(
    conn: &Connection,
    session_id: i64,
) -> rusqlite::Result<Option<Session>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1");
    conn.query_row(&sql, params![session_id], row_to_session)
        .optional()
}

pub(crate) fn query_attendance(
    conn: &Connection,
    session_id: i64,
    identity_id: i64,
) -> rusqlite::Result<Option<AttendanceRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM attendances WHERE session_id = ?1 AND identity_id = ?2"
    );
    conn.query_row(&sql, params![session_id, identity_id], row_to_record)
        .optional()
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let date: String = row.get("date")?;
    let start_time: String = row.get("start_time")?;
    let end_time: String = row.get("end_time")?;

    Ok(Session {
        session_id: row.get("session_id")?,
        course_id: row.get("course_id")?,
        date: NaiveDate::parse_from_str(&date, DATE_FMT).map_err(|e| conversion_error(2, e))?,
        start_time: NaiveTime::parse_from_str(&start_time, TIME_FMT)
            .map_err(|e| conversion_error(3, e))?,
        end_time: NaiveTime::parse_from_str(&end_time, TIME_FMT)
            .map_err(|e| conversion_error(4, e))?,
        is_open: row.get("is_open")?,
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<AttendanceRecord> {
    let status: String = row.get("status")?;
    let recorded_at: String = row.get("recorded_at")?;

    Ok(AttendanceRecord {
        record_id: row.get("record_id")?,
        session_id: row.get("session_id")?,
        identity_id: row.get("identity_id")?,
        status: status.parse().map_err(|e: String| conversion_error(3, e))?,
        confidence: row.get("confidence")?,
        recorded_at: NaiveDateTime::parse_from_str(&recorded_at, DATETIME_FMT)
            .map_err(|e| conversion_error(5, e))?,
    })
}

fn row_to_identity(row: &Row) -> rusqlite::Result<EnrolledIdentity> {
    let identity_id: i64 = row.get("identity_id")?;
    let role: String = row.get("role")?;
    let blob: Option<Vec<u8>> = row.get("descriptor")?;

    let descriptor = match blob {
        Some(bytes) => {
            let decoded = Descriptor::from_le_bytes(&bytes);
            if decoded.is_none() {
                tracing::warn!(identity_id, len = bytes.len(), "unreadable stored descriptor");
            }
            decoded
        }
        None => None,
    };

    Ok(EnrolledIdentity {
        identity_id,
        role: role.parse().map_err(|e: String| conversion_error(1, e))?,
        name: row.get("name")?,
        descriptor,
    })
}
