//! Attendance recording.
//!
//! The existence checks and the insert share one IMMEDIATE transaction on the
//! connection thread, and `UNIQUE(session_id, identity_id)` backs them up: two
//! concurrent requests for the same pair cannot both commit. A constraint hit
//! is reported as [`RecordError::Duplicate`] carrying the row that won.

use crate::error::RecordError;
use crate::store::{format_datetime, query_attendance, query_session, Store};
use presence_core::{AttendanceRecord, AttendanceStatus, Clock, Descriptor, WindowPolicy};
use rusqlite::{params, Connection, TransactionBehavior};
use std::sync::Arc;

/// How the status of a new record is chosen.
#[derive(Debug, Clone, Copy)]
pub enum StatusRule {
    /// Caller-decided status.
    Fixed(AttendanceStatus),
    /// Evaluate the window policy at the instant of recording.
    Window(WindowPolicy),
}

/// One attempt to record attendance.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub session_id: i64,
    pub identity_id: i64,
    pub confidence: f64,
    pub rule: StatusRule,
    /// Probe descriptor to keep as an unverified learning sample.
    pub sample: Option<Descriptor>,
}

impl Store {
    /// Record attendance with an explicit status.
    pub async fn record(
        &self,
        session_id: i64,
        identity_id: i64,
        status: AttendanceStatus,
        confidence: f64,
    ) -> Result<AttendanceRecord, RecordError> {
        self.record_attendance(RecordRequest {
            session_id,
            identity_id,
            confidence,
            rule: StatusRule::Fixed(status),
            sample: None,
        })
        .await
    }

    /// Record attendance, checking the session and window inside the write transaction.
    pub async fn record_attendance(
        &self,
        request: RecordRequest,
    ) -> Result<AttendanceRecord, RecordError> {
        let clock = Arc::clone(&self.clock);
        let session_id = request.session_id;
        let identity_id = request.identity_id;

        let result = self
            .conn
            .call(move |conn| Ok(record_in_tx(conn, &request, clock.as_ref())))
            .await?;

        match &result {
            Ok(record) => tracing::info!(
                session_id,
                identity_id,
                status = %record.status,
                confidence = record.confidence,
                "attendance recorded"
            ),
            Err(RecordError::Duplicate { existing }) => tracing::debug!(
                session_id,
                identity_id,
                status = %existing.status,
                "attendance already recorded"
            ),
            Err(err) => tracing::debug!(session_id, identity_id, error = %err, "attendance not recorded"),
        }

        result
    }
}

fn record_in_tx(
    conn: &mut Connection,
    request: &RecordRequest,
    clock: &dyn Clock,
) -> Result<AttendanceRecord, RecordError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let session = query_session(&tx, request.session_id)?
        .ok_or(RecordError::SessionNotFound(request.session_id))?;
    if !session.is_open {
        return Err(RecordError::SessionClosed { session });
    }

    // Read the clock only once the write lock is held.
    let now = clock.now();

    let status = match request.rule {
        StatusRule::Fixed(status) => status,
        StatusRule::Window(policy) => {
            let decision = policy.decide_at(&session, now);
            match decision.status() {
                Some(status) => status,
                None => return Err(RecordError::OutsideWindow { decision, session }),
            }
        }
    };
    if status == AttendanceStatus::Absent {
        return Err(RecordError::NotRecordable(status));
    }

    let identity_exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM identities WHERE identity_id = ?1)",
        params![request.identity_id],
        |row| row.get(0),
    )?;
    if !identity_exists {
        return Err(RecordError::IdentityNotFound(request.identity_id));
    }

    let inserted = tx.execute(
        "INSERT INTO attendances (session_id, identity_id, status, confidence, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            request.session_id,
            request.identity_id,
            status.as_str(),
            request.confidence,
            format_datetime(now),
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => {
            let existing = query_attendance(&tx, request.session_id, request.identity_id)?
                .ok_or_else(|| RecordError::from(err))?;
            return Err(RecordError::Duplicate { existing });
        }
        Err(err) => return Err(err.into()),
    }
    let record_id = tx.last_insert_rowid();

    if let Some(sample) = &request.sample {
        tx.execute(
            "INSERT INTO identity_embeddings (identity_id, session_id, descriptor, is_verified, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                request.identity_id,
                request.session_id,
                sample.to_le_bytes(),
                format_datetime(now),
            ],
        )?;
    }

    tx.commit()?;

    Ok(AttendanceRecord {
        record_id,
        session_id: request.session_id,
        identity_id: request.identity_id,
        status,
        confidence: request.confidence,
        recorded_at: now,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use presence_core::{FixedClock, Role, WindowDecision};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    async fn setup(now: NaiveDateTime) -> (Store, Arc<FixedClock>, i64) {
        let clock = Arc::new(FixedClock::new(now));
        let store = Store::open_in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone());
        store
            .enroll(42, Role::Student, "Amina", Some(Descriptor::new(vec![0.1, 0.2])))
            .await
            .unwrap();
        let session = store
            .start_session(7, at(0, 0, 0).date(), t(8, 0), t(10, 0))
            .await
            .unwrap();
        (store, clock, session.session_id)
    }

    fn window_request(session_id: i64, identity_id: i64) -> RecordRequest {
        RecordRequest {
            session_id,
            identity_id,
            confidence: 0.5,
            rule: StatusRule::Window(WindowPolicy::default()),
            sample: Some(Descriptor::new(vec![0.1, 0.25])),
        }
    }

    #[tokio::test]
    async fn test_record_then_duplicate() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;

        let first = store.record(sid, 42, AttendanceStatus::Present, 0.7).await.unwrap();
        assert_eq!(first.status, AttendanceStatus::Present);

        match store.record(sid, 42, AttendanceStatus::Late, 0.9).await {
            Err(RecordError::Duplicate { existing }) => {
                assert_eq!(existing.record_id, first.record_id);
                assert_eq!(existing.status, AttendanceStatus::Present);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        assert_eq!(store.list_attendance(sid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_records_single_winner() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;

        let (a, b) = tokio::join!(
            store.record_attendance(window_request(sid, 42)),
            store.record_attendance(window_request(sid, 42)),
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(RecordError::Duplicate { .. })));
        assert_eq!(store.list_attendance(sid).await.unwrap().len(), 1);
        assert_eq!(store.count_learning_samples(42).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_evaluated_at_recording() {
        let (store, clock, sid) = setup(at(8, 10, 0)).await;
        clock.advance(Duration::minutes(25));

        let record = store.record_attendance(window_request(sid, 42)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.recorded_at, at(8, 35, 0));
    }

    #[tokio::test]
    async fn test_outside_window_refused() {
        let (store, clock, sid) = setup(at(7, 50, 0)).await;

        match store.record_attendance(window_request(sid, 42)).await {
            Err(RecordError::OutsideWindow { decision, .. }) => {
                assert_eq!(decision, WindowDecision::TooEarly)
            }
            other => panic!("expected refusal, got {other:?}"),
        }

        clock.set(at(10, 0, 1));
        match store.record_attendance(window_request(sid, 42)).await {
            Err(RecordError::OutsideWindow { decision, .. }) => {
                assert_eq!(decision, WindowDecision::TooLate)
            }
            other => panic!("expected refusal, got {other:?}"),
        }

        assert!(store.list_attendance(sid).await.unwrap().is_empty());
        assert_eq!(store.count_learning_samples(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_refused() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;
        assert!(store.end_session(sid).await.unwrap());

        let err = store.record(sid, 42, AttendanceStatus::Present, 0.7).await.unwrap_err();
        assert!(matches!(err, RecordError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_missing_keys() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;

        let err = store.record(sid + 100, 42, AttendanceStatus::Present, 0.7).await.unwrap_err();
        assert!(matches!(err, RecordError::SessionNotFound(id) if id == sid + 100));

        let err = store.record(sid, 999, AttendanceStatus::Present, 0.7).await.unwrap_err();
        assert!(matches!(err, RecordError::IdentityNotFound(999)));
    }

    #[tokio::test]
    async fn test_absent_not_recordable() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;
        let err = store.record(sid, 42, AttendanceStatus::Absent, 0.0).await.unwrap_err();
        assert!(matches!(err, RecordError::NotRecordable(AttendanceStatus::Absent)));
    }

    #[tokio::test]
    async fn test_sample_stored_with_record() {
        let (store, _clock, sid) = setup(at(8, 10, 0)).await;
        store.record_attendance(window_request(sid, 42)).await.unwrap();
        assert_eq!(store.count_learning_samples(42).await.unwrap(), 1);

        // The duplicate rolls back, including its sample.
        let _ = store.record_attendance(window_request(sid, 42)).await;
        assert_eq!(store.count_learning_samples(42).await.unwrap(), 1);
    }
}
