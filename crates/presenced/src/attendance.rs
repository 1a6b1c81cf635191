//! Recognition orchestration.
//!
//! One attempt walks: session lookup and window check, descriptor
//! extraction, nearest-neighbor match, then the transactional record.
//! Every domain failure ends as a [`RecognitionOutcome`]; only storage and
//! engine-channel failures surface as [`ServiceError`].

use crate::engine::{EngineError, EngineHandle};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::policy::describe;
use presence_core::{
    identify, AttendanceRecord, AttendanceStatus, Descriptor, DistanceThreshold,
    EnrolledIdentity, LinearScanMatcher, MatchOutcome, NoFaceReason, Role, Session,
    WindowDecision, WindowPolicy,
};
use presence_store::{RecordError, RecordRequest, StatusRule, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("recorder: {0}")]
    Record(#[from] RecordError),
    #[error("extraction engine: {0}")]
    Engine(EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    TooEarly,
    TooLate,
    SessionClosed,
}

/// Terminal state of one recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Recorded {
        record: AttendanceRecord,
        name: String,
        distance: f64,
    },
    Refused {
        reason: RefusalReason,
        message: String,
        starts_at: NaiveTime,
        ends_at: NaiveTime,
    },
    SessionNotFound {
        session_id: i64,
    },
    /// `distance` is `None` when nothing enrolled was comparable.
    Unrecognized {
        distance: Option<f64>,
    },
    AlreadyRecorded {
        identity_id: i64,
        status: AttendanceStatus,
        recorded_at: NaiveDateTime,
    },
    NoFaceDetected {
        detail: NoFaceReason,
    },
    InvalidImage {
        message: String,
    },
}

impl RecognitionOutcome {
    fn refused(reason: RefusalReason, session: &Session) -> Self {
        let message = match reason {
            RefusalReason::TooEarly => describe(WindowDecision::TooEarly, session),
            RefusalReason::TooLate => describe(WindowDecision::TooLate, session),
            RefusalReason::SessionClosed => {
                format!("session {} has been closed", session.session_id)
            }
        };
        RecognitionOutcome::Refused {
            reason,
            message,
            starts_at: session.start_time,
            ends_at: session.end_time,
        }
    }

    /// Short user-facing summary.
    pub fn message(&self) -> String {
        match self {
            RecognitionOutcome::Recorded { record, name, .. } => {
                format!("{name} marked {}", record.status)
            }
            RecognitionOutcome::Refused { message, .. } => message.clone(),
            RecognitionOutcome::SessionNotFound { session_id } => {
                format!("session {session_id} not found")
            }
            RecognitionOutcome::Unrecognized { distance: Some(d) } => {
                format!("face not recognized (distance {d:.2})")
            }
            RecognitionOutcome::Unrecognized { distance: None } => {
                "face not recognized (no enrolled descriptors to compare)".to_string()
            }
            RecognitionOutcome::AlreadyRecorded { status, .. } => {
                format!("already marked {status}")
            }
            RecognitionOutcome::NoFaceDetected { detail } => match detail {
                NoFaceReason::NoFace => "no face detected".to_string(),
                NoFaceReason::LowConfidence { .. } => "face quality too low".to_string(),
                NoFaceReason::FaceTooSmall { .. } => "face too small in frame".to_string(),
                NoFaceReason::Timeout => "face extraction timed out".to_string(),
            },
            RecognitionOutcome::InvalidImage { message } => format!("invalid image: {message}"),
        }
    }
}

/// Result of an enrollment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled { identity_id: i64, role: Role, dimensions: usize },
    NoFaceDetected { detail: NoFaceReason },
    InvalidImage { message: String },
}

/// Result of matching a face without any session or record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IdentifyOutcome {
    Identified {
        identity_id: i64,
        role: Role,
        name: String,
        confidence: f64,
        distance: f64,
        threshold: f64,
    },
    /// Nearest enrolled descriptor is farther than the threshold.
    AboveThreshold { distance: f64, threshold: f64 },
    /// No enrolled descriptor has the probe's dimension.
    NoComparableDescriptor { candidates: usize },
    NoFaceDetected { detail: NoFaceReason },
    InvalidImage { message: String },
}

impl IdentifyOutcome {
    pub fn message(&self) -> String {
        match self {
            IdentifyOutcome::Identified { name, confidence, .. } => {
                format!("identified {name} (confidence {confidence:.2})")
            }
            IdentifyOutcome::AboveThreshold { distance, threshold } => {
                format!("not recognized (distance {distance:.2} > threshold {threshold})")
            }
            IdentifyOutcome::NoComparableDescriptor { candidates: 0 } => {
                "no identities enrolled".to_string()
            }
            IdentifyOutcome::NoComparableDescriptor { candidates } => {
                format!("none of {candidates} enrolled descriptors is comparable")
            }
            IdentifyOutcome::NoFaceDetected { .. } => "no usable face detected".to_string(),
            IdentifyOutcome::InvalidImage { message } => format!("invalid image: {message}"),
        }
    }
}

/// Whether a session currently accepts recognition, without running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatus {
    pub session_id: i64,
    pub is_open: bool,
    pub can_detect: bool,
    pub decision: WindowDecision,
    pub current_status: Option<AttendanceStatus>,
    pub message: String,
    pub starts_at: NaiveTime,
    pub ends_at: NaiveTime,
    pub late_after: NaiveDateTime,
    pub current_time: NaiveDateTime,
}

/// Tunables for the recognition flow.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub threshold: DistanceThreshold,
    pub policy: WindowPolicy,
    pub extract_timeout: Duration,
    pub match_role: Option<Role>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            threshold: DistanceThreshold::default(),
            policy: WindowPolicy::default(),
            extract_timeout: Duration::from_secs(10),
            match_role: None,
        }
    }
}

enum Extraction {
    Descriptor(Descriptor),
    NoFace(NoFaceReason),
    InvalidImage(String),
}

pub struct AttendanceService {
    store: Store,
    engine: EngineHandle,
    settings: ServiceSettings,
}

impl AttendanceService {
    pub fn new(store: Store, engine: EngineHandle, settings: ServiceSettings) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }

    /// Run one recognition attempt against `session_id`.
    pub async fn recognize(
        &self,
        session_id: i64,
        image: Vec<u8>,
    ) -> Result<RecognitionOutcome, ServiceError> {
        if image.is_empty() {
            return Ok(RecognitionOutcome::InvalidImage {
                message: "image buffer is empty".to_string(),
            });
        }

        // Refusals short-circuit before any extraction work.
        let Some(session) = self.store.get_session(session_id).await? else {
            tracing::debug!(session_id, "recognize: session not found");
            return Ok(RecognitionOutcome::SessionNotFound { session_id });
        };
        if let Some(refusal) = self.refusal_now(&session) {
            tracing::debug!(session_id, outcome = ?refusal, "recognize: refused");
            return Ok(refusal);
        }

        let descriptor = match self.extract(image).await? {
            Extraction::Descriptor(descriptor) => descriptor,
            Extraction::NoFace(detail) => {
                tracing::debug!(session_id, ?detail, "recognize: no usable face");
                return Ok(RecognitionOutcome::NoFaceDetected { detail });
            }
            Extraction::InvalidImage(message) => {
                return Ok(RecognitionOutcome::InvalidImage { message });
            }
        };

        let candidates = self.store.list_enrolled(self.settings.match_role).await?;
        let (identity_id, name, distance, confidence) = match identify(
            &LinearScanMatcher,
            &descriptor,
            &candidates,
            self.settings.threshold,
        ) {
            MatchOutcome::Matched {
                identity_id,
                name,
                distance,
                confidence,
                ..
            } => (identity_id, name, distance, confidence),
            MatchOutcome::Unrecognized { distance } => {
                tracing::info!(
                    session_id,
                    candidates = candidates.len(),
                    distance = ?distance,
                    "recognize: unrecognized"
                );
                return Ok(RecognitionOutcome::Unrecognized { distance });
            }
        };

        tracing::debug!(session_id, identity_id, distance, "recognize: matched");

        let request = RecordRequest {
            session_id,
            identity_id,
            confidence,
            rule: StatusRule::Window(self.settings.policy),
            sample: Some(descriptor),
        };

        match self.store.record_attendance(request).await {
            Ok(record) => Ok(RecognitionOutcome::Recorded {
                record,
                name,
                distance,
            }),
            Err(RecordError::Duplicate { existing }) => Ok(RecognitionOutcome::AlreadyRecorded {
                identity_id,
                status: existing.status,
                recorded_at: existing.recorded_at,
            }),
            Err(RecordError::SessionNotFound(id)) => {
                Ok(RecognitionOutcome::SessionNotFound { session_id: id })
            }
            Err(RecordError::SessionClosed { session }) => Ok(RecognitionOutcome::refused(
                RefusalReason::SessionClosed,
                &session,
            )),
            Err(RecordError::OutsideWindow { decision, session }) => {
                let reason = if decision == WindowDecision::TooEarly {
                    RefusalReason::TooEarly
                } else {
                    RefusalReason::TooLate
                };
                Ok(RecognitionOutcome::refused(reason, &session))
            }
            // Identity removed between the scan and the insert.
            Err(RecordError::IdentityNotFound(_)) => Ok(RecognitionOutcome::Unrecognized {
                distance: Some(distance),
            }),
            Err(err) => {
                tracing::error!(session_id, identity_id, error = %err, "recognize: storage failure");
                Err(err.into())
            }
        }
    }

    /// Window and open-state check at the current instant.
    fn refusal_now(&self, session: &Session) -> Option<RecognitionOutcome> {
        if !session.is_open {
            return Some(RecognitionOutcome::refused(RefusalReason::SessionClosed, session));
        }
        match self.settings.policy.decide_at(session, self.store.now()) {
            WindowDecision::TooEarly => {
                Some(RecognitionOutcome::refused(RefusalReason::TooEarly, session))
            }
            WindowDecision::TooLate => {
                Some(RecognitionOutcome::refused(RefusalReason::TooLate, session))
            }
            WindowDecision::Present | WindowDecision::Late => None,
        }
    }

    async fn extract(&self, image: Vec<u8>) -> Result<Extraction, ServiceError> {
        match tokio::time::timeout(self.settings.extract_timeout, self.engine.extract(image)).await
        {
            Ok(Ok(descriptor)) => Ok(Extraction::Descriptor(descriptor)),
            Ok(Err(EngineError::NoFace(reason))) => Ok(Extraction::NoFace(reason)),
            Ok(Err(EngineError::Provider(err))) if err.is_input_error() => {
                Ok(Extraction::InvalidImage(err.to_string()))
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "descriptor extraction failed");
                Err(ServiceError::Engine(err))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.settings.extract_timeout.as_secs_f64(),
                    "descriptor extraction timed out"
                );
                Ok(Extraction::NoFace(NoFaceReason::Timeout))
            }
        }
    }

    pub async fn detection_status(
        &self,
        session_id: i64,
    ) -> Result<Option<DetectionStatus>, ServiceError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        let now = self.store.now();
        let decision = self.settings.policy.decide_at(&session, now);
        let can_detect = session.is_open && decision.allows_detection();
        let message = if session.is_open {
            describe(decision, &session)
        } else {
            format!("session {} has been closed", session.session_id)
        };

        Ok(Some(DetectionStatus {
            session_id,
            is_open: session.is_open,
            can_detect,
            decision,
            current_status: if can_detect { decision.status() } else { None },
            message,
            starts_at: session.start_time,
            ends_at: session.end_time,
            late_after: self.settings.policy.late_cutoff(&session),
            current_time: now,
        }))
    }

    /// Extract a descriptor from `image` and enroll it for `identity_id`.
    pub async fn enroll(
        &self,
        identity_id: i64,
        role: Role,
        name: &str,
        image: Vec<u8>,
    ) -> Result<EnrollOutcome, ServiceError> {
        let descriptor = match self.extract(image).await? {
            Extraction::Descriptor(descriptor) => descriptor,
            Extraction::NoFace(detail) => return Ok(EnrollOutcome::NoFaceDetected { detail }),
            Extraction::InvalidImage(message) => return Ok(EnrollOutcome::InvalidImage { message }),
        };
        let dimensions = descriptor.len();
        self.store
            .enroll(identity_id, role, name, Some(descriptor))
            .await?;
        Ok(EnrollOutcome::Enrolled {
            identity_id,
            role,
            dimensions,
        })
    }

    /// Match the face in `image` against enrolled identities. Touches no session
    /// and records nothing.
    pub async fn identify(&self, image: Vec<u8>) -> Result<IdentifyOutcome, ServiceError> {
        let descriptor = match self.extract(image).await? {
            Extraction::Descriptor(descriptor) => descriptor,
            Extraction::NoFace(detail) => return Ok(IdentifyOutcome::NoFaceDetected { detail }),
            Extraction::InvalidImage(message) => {
                return Ok(IdentifyOutcome::InvalidImage { message })
            }
        };

        let candidates = self.store.list_enrolled(self.settings.match_role).await?;
        let threshold = self.settings.threshold.tau();
        let outcome = match identify(
            &LinearScanMatcher,
            &descriptor,
            &candidates,
            self.settings.threshold,
        ) {
            MatchOutcome::Matched {
                identity_id,
                role,
                name,
                distance,
                confidence,
            } => IdentifyOutcome::Identified {
                identity_id,
                role,
                name,
                confidence,
                distance,
                threshold,
            },
            MatchOutcome::Unrecognized {
                distance: Some(distance),
            } => IdentifyOutcome::AboveThreshold {
                distance,
                threshold,
            },
            MatchOutcome::Unrecognized { distance: None } => {
                IdentifyOutcome::NoComparableDescriptor {
                    candidates: candidates.len(),
                }
            }
        };
        tracing::debug!(outcome = ?outcome, "identify");
        Ok(outcome)
    }

    pub async fn start_session(
        &self,
        course_id: i64,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Session, ServiceError> {
        Ok(self
            .store
            .start_session(course_id, date, start_time, end_time)
            .await?)
    }

    pub async fn end_session(&self, session_id: i64) -> Result<bool, ServiceError> {
        Ok(self.store.end_session(session_id).await?)
    }

    pub async fn list_attendance(
        &self,
        session_id: i64,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self.store.list_attendance(session_id).await?)
    }

    pub async fn list_absent(
        &self,
        session_id: i64,
    ) -> Result<Vec<EnrolledIdentity>, ServiceError> {
        Ok(self.store.list_absent(session_id, Role::Student).await?)
    }

    /// Attendance history of one identity, newest first.
    pub async fn history(&self, identity_id: i64) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self.store.list_attendance_for_identity(identity_id).await?)
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{png_bytes, ScriptedProvider};
    use crate::engine::Engine;
    use presence_core::{FaceGate, FixedClock};
    use std::sync::Arc;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        day().and_hms_opt(h, m, s).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    struct Fixture {
        service: AttendanceService,
        clock: Arc<FixedClock>,
        engine: Engine,
        session_id: i64,
    }

    /// Session 08:00–10:00; identity 1 enrolled at the origin, identity 2 far away.
    async fn fixture(provider: ScriptedProvider, now: NaiveDateTime) -> Fixture {
        let clock = Arc::new(FixedClock::new(now));
        let store = Store::open_in_memory().await.unwrap().with_clock(clock.clone());
        store
            .enroll(1, Role::Student, "X", Some(Descriptor::new(vec![0.0, 0.0, 0.0, 0.0])))
            .await
            .unwrap();
        store
            .enroll(2, Role::Student, "Y", Some(Descriptor::new(vec![5.0, 5.0, 5.0, 5.0])))
            .await
            .unwrap();
        let session = store.start_session(3, day(), t(8, 0), t(10, 0)).await.unwrap();

        let engine = Engine::open(Box::new(provider), FaceGate::default()).unwrap();
        let settings = ServiceSettings {
            extract_timeout: Duration::from_millis(200),
            ..ServiceSettings::default()
        };
        let service = AttendanceService::new(store, engine.handle(), settings);
        Fixture {
            service,
            clock,
            engine,
            session_id: session.session_id,
        }
    }

    #[tokio::test]
    async fn test_recorded_then_already_recorded() {
        let fx = fixture(ScriptedProvider::single(vec![0.3, 0.0, 0.0, 0.0]), at(8, 10, 0)).await;

        let first = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        match &first {
            RecognitionOutcome::Recorded { record, name, .. } => {
                assert_eq!(name, "X");
                assert_eq!(record.identity_id, 1);
                assert_eq!(record.status, AttendanceStatus::Present);
                assert!((record.confidence - (1.0 - 0.3 / 0.9)).abs() < 1e-3);
            }
            other => panic!("expected recorded, got {other:?}"),
        }

        // 08:40 alone would be late; the first record stands.
        fx.clock.set(at(8, 40, 0));
        let second = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert_eq!(
            second,
            RecognitionOutcome::AlreadyRecorded {
                identity_id: 1,
                status: AttendanceStatus::Present,
                recorded_at: at(8, 10, 0),
            }
        );
        assert_eq!(fx.service.list_attendance(fx.session_id).await.unwrap().len(), 1);
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_late_arrival() {
        let fx = fixture(ScriptedProvider::single(vec![0.1, 0.0, 0.0, 0.0]), at(9, 15, 0)).await;
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert!(matches!(
            outcome,
            RecognitionOutcome::Recorded { ref record, .. } if record.status == AttendanceStatus::Late
        ));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_refusals_carry_boundaries() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(7, 30, 0)).await;

        let early = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        match &early {
            RecognitionOutcome::Refused { reason, starts_at, ends_at, message } => {
                assert_eq!(*reason, RefusalReason::TooEarly);
                assert_eq!(*starts_at, t(8, 0));
                assert_eq!(*ends_at, t(10, 0));
                assert!(message.contains("08:00"));
            }
            other => panic!("expected refusal, got {other:?}"),
        }

        fx.clock.set(at(10, 0, 1));
        let late = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert!(matches!(
            late,
            RecognitionOutcome::Refused { reason: RefusalReason::TooLate, .. }
        ));
        assert!(fx.service.list_attendance(fx.session_id).await.unwrap().is_empty());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_closed_session_refused_in_window() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 5, 0)).await;
        assert!(fx.service.end_session(fx.session_id).await.unwrap());
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert!(matches!(
            outcome,
            RecognitionOutcome::Refused { reason: RefusalReason::SessionClosed, .. }
        ));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_refusal_skips_extraction() {
        // A provider slower than the timeout would report Timeout if it ran.
        let mut provider = ScriptedProvider::single(vec![0.0; 4]);
        provider.delay = Duration::from_secs(2);
        let fx = fixture(provider, at(11, 0, 0)).await;
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert!(matches!(
            outcome,
            RecognitionOutcome::Refused { reason: RefusalReason::TooLate, .. }
        ));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 5, 0)).await;
        let outcome = fx.service.recognize(999, png_bytes(200, 200)).await.unwrap();
        assert_eq!(outcome, RecognitionOutcome::SessionNotFound { session_id: 999 });
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_unrecognized_reports_distance() {
        let fx = fixture(ScriptedProvider::single(vec![2.0, 0.0, 0.0, 0.0]), at(8, 5, 0)).await;
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert_eq!(outcome, RecognitionOutcome::Unrecognized { distance: Some(2.0) });
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_no_comparable_descriptor() {
        // Probe dimension differs from every enrolled descriptor.
        let fx = fixture(ScriptedProvider::single(vec![0.0, 0.0]), at(8, 5, 0)).await;
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert_eq!(outcome, RecognitionOutcome::Unrecognized { distance: None });
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_no_face_and_invalid_image() {
        let mut provider = ScriptedProvider::single(vec![0.0; 4]);
        provider.faces.clear();
        let fx = fixture(provider, at(8, 5, 0)).await;

        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert_eq!(
            outcome,
            RecognitionOutcome::NoFaceDetected { detail: NoFaceReason::NoFace }
        );

        let outcome = fx.service.recognize(fx.session_id, b"not an image".to_vec()).await.unwrap();
        assert!(matches!(outcome, RecognitionOutcome::InvalidImage { .. }));

        let outcome = fx.service.recognize(fx.session_id, Vec::new()).await.unwrap();
        assert!(matches!(outcome, RecognitionOutcome::InvalidImage { .. }));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_extraction_timeout() {
        let mut provider = ScriptedProvider::single(vec![0.0; 4]);
        provider.delay = Duration::from_millis(600);
        let fx = fixture(provider, at(8, 5, 0)).await;

        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert_eq!(
            outcome,
            RecognitionOutcome::NoFaceDetected { detail: NoFaceReason::Timeout }
        );
        assert!(fx.service.list_attendance(fx.session_id).await.unwrap().is_empty());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_same_identity() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 5, 0)).await;
        let (a, b) = tokio::join!(
            fx.service.recognize(fx.session_id, png_bytes(200, 200)),
            fx.service.recognize(fx.session_id, png_bytes(200, 200)),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let recorded = outcomes
            .iter()
            .filter(|o| matches!(o, RecognitionOutcome::Recorded { .. }))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, RecognitionOutcome::AlreadyRecorded { .. }))
            .count();
        assert_eq!((recorded, duplicates), (1, 1));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_detection_status() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 45, 0)).await;
        let status = fx.service.detection_status(fx.session_id).await.unwrap().unwrap();
        assert!(status.can_detect);
        assert_eq!(status.decision, WindowDecision::Late);
        assert_eq!(status.current_status, Some(AttendanceStatus::Late));
        assert_eq!(status.late_after, at(8, 30, 0));

        fx.service.end_session(fx.session_id).await.unwrap();
        let status = fx.service.detection_status(fx.session_id).await.unwrap().unwrap();
        assert!(!status.can_detect);
        assert_eq!(status.current_status, None);

        assert!(fx.service.detection_status(404).await.unwrap().is_none());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_enroll_from_image() {
        let fx = fixture(ScriptedProvider::single(vec![1.0, 1.0, 1.0, 1.0]), at(8, 5, 0)).await;
        let outcome = fx
            .service
            .enroll(77, Role::Teacher, "Prof", png_bytes(200, 200))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EnrollOutcome::Enrolled { identity_id: 77, role: Role::Teacher, dimensions: 4 }
        );

        // Teachers match too when no role filter is set.
        let outcome = fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        assert!(matches!(
            outcome,
            RecognitionOutcome::Recorded { ref record, .. } if record.identity_id == 77
        ));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_absent_list_excludes_recorded() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 5, 0)).await;
        fx.service.recognize(fx.session_id, png_bytes(200, 200)).await.unwrap();
        let absent = fx.service.list_absent(fx.session_id).await.unwrap();
        let ids: Vec<i64> = absent.iter().map(|i| i.identity_id).collect();
        assert_eq!(ids, vec![2]);
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_identify_matches_without_recording() {
        let fx = fixture(ScriptedProvider::single(vec![0.3, 0.0, 0.0, 0.0]), at(8, 5, 0)).await;
        match fx.service.identify(png_bytes(200, 200)).await.unwrap() {
            IdentifyOutcome::Identified { identity_id, name, threshold, distance, .. } => {
                assert_eq!(identity_id, 1);
                assert_eq!(name, "X");
                assert_eq!(threshold, 0.9);
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("expected identified, got {other:?}"),
        }
        assert!(fx.service.list_attendance(fx.session_id).await.unwrap().is_empty());
        assert!(fx.service.history(1).await.unwrap().is_empty());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_identify_above_threshold() {
        let fx = fixture(ScriptedProvider::single(vec![2.0, 0.0, 0.0, 0.0]), at(8, 5, 0)).await;
        let outcome = fx.service.identify(png_bytes(200, 200)).await.unwrap();
        assert_eq!(
            outcome,
            IdentifyOutcome::AboveThreshold { distance: 2.0, threshold: 0.9 }
        );
        assert!(fx.service.list_attendance(fx.session_id).await.unwrap().is_empty());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_identify_no_comparable_descriptor() {
        let fx = fixture(ScriptedProvider::single(vec![0.0, 0.0]), at(8, 5, 0)).await;
        let outcome = fx.service.identify(png_bytes(200, 200)).await.unwrap();
        assert_eq!(outcome, IdentifyOutcome::NoComparableDescriptor { candidates: 2 });
        assert!(fx.service.list_attendance(fx.session_id).await.unwrap().is_empty());
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_identify_outside_any_window() {
        // No session gating: works at midnight too.
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(0, 0, 0)).await;
        let outcome = fx.service.identify(png_bytes(200, 200)).await.unwrap();
        assert!(matches!(outcome, IdentifyOutcome::Identified { identity_id: 1, .. }));
        let outcome = fx.service.identify(Vec::new()).await.unwrap();
        assert!(matches!(outcome, IdentifyOutcome::InvalidImage { .. }));
        fx.engine.close().await;
    }

    #[tokio::test]
    async fn test_two_identities_record_concurrently() {
        let fx = fixture(ScriptedProvider::single(vec![0.0; 4]), at(8, 5, 0)).await;
        let store = fx.service.store.clone();
        let request = |identity_id| RecordRequest {
            session_id: fx.session_id,
            identity_id,
            confidence: 0.8,
            rule: StatusRule::Window(WindowPolicy::default()),
            sample: None,
        };
        let (a, b) = tokio::join!(
            store.record_attendance(request(1)),
            store.record_attendance(request(2)),
        );
        assert_eq!(a.unwrap().status, AttendanceStatus::Present);
        assert_eq!(b.unwrap().status, AttendanceStatus::Present);
        assert_eq!(fx.service.list_attendance(fx.session_id).await.unwrap().len(), 2);
        fx.engine.close().await;
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_value(RecognitionOutcome::Unrecognized { distance: None }).unwrap();
        assert_eq!(json["outcome"], "unrecognized");
        assert!(json["distance"].is_null());

        let json = serde_json::to_value(RecognitionOutcome::NoFaceDetected {
            detail: NoFaceReason::Timeout,
        })
        .unwrap();
        assert_eq!(json["outcome"], "no_face_detected");
        assert_eq!(json["detail"]["reason"], "timeout");
    }
}
