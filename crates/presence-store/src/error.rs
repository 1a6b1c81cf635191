use presence_core::{AttendanceRecord, AttendanceStatus, Session, WindowDecision};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("no migration defined for schema version {0}")]
    UnknownMigration(i32),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("session must end after it starts ({start} >= {end})")]
    InvalidWindow { start: String, end: String },
}

/// Failure to record attendance. Every variant except `Store` is a domain outcome.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("session {0} not found")]
    SessionNotFound(i64),
    #[error("identity {0} not found")]
    IdentityNotFound(i64),
    #[error("session {} is closed", .session.session_id)]
    SessionClosed { session: Session },
    #[error("session {} does not accept attendance now ({decision:?})", .session.session_id)]
    OutsideWindow {
        decision: WindowDecision,
        session: Session,
    },
    #[error("attendance already recorded as {}", .existing.status)]
    Duplicate { existing: AttendanceRecord },
    #[error("status '{0}' cannot be recorded")]
    NotRecordable(AttendanceStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RecordError {
    fn from(err: rusqlite::Error) -> Self {
        RecordError::Store(StoreError::Sqlite(err))
    }
}

impl From<tokio_rusqlite::Error> for RecordError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        RecordError::Store(StoreError::Connection(err))
    }
}
