use crate::attendance::{AttendanceService, ServiceError};
use chrono::{NaiveDate, NaiveTime};
use presence_core::{EnrolledIdentity, Role};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use zbus::{fdo, interface};

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
///
/// Structured results are returned as JSON strings.
pub struct PresenceService {
    service: Arc<AttendanceService>,
    provider: String,
    db_path: String,
}

impl PresenceService {
    pub fn new(service: Arc<AttendanceService>, provider: String, db_path: String) -> Self {
        Self {
            service,
            provider,
            db_path,
        }
    }
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Recognize the face in `image` (encoded JPEG/PNG) and record attendance for `session_id`.
    async fn recognize(&self, session_id: i64, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(session_id, bytes = image.len(), "recognize requested");
        let outcome = self
            .service
            .recognize(session_id, image)
            .await
            .map_err(internal)?;
        with_summary(&outcome, outcome.message())
    }

    /// Match the face in `image` without touching any session.
    async fn identify(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "identify requested");
        let outcome = self.service.identify(image).await.map_err(internal)?;
        with_summary(&outcome, outcome.message())
    }

    /// Report whether `session_id` currently accepts recognition.
    async fn detection_status(&self, session_id: i64) -> fdo::Result<String> {
        match self
            .service
            .detection_status(session_id)
            .await
            .map_err(internal)?
        {
            Some(status) => to_json(&status),
            None => Err(fdo::Error::InvalidArgs(format!(
                "session {session_id} not found"
            ))),
        }
    }

    /// Open a session. `date` is `YYYY-MM-DD`, times are `HH:MM` or `HH:MM:SS`.
    async fn start_session(
        &self,
        course_id: i64,
        date: &str,
        start: &str,
        end: &str,
    ) -> fdo::Result<String> {
        tracing::info!(course_id, date, start, end, "start_session requested");
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| fdo::Error::InvalidArgs(format!("date '{date}': {e}")))?;
        let start = parse_time(start)?;
        let end = parse_time(end)?;
        match self.service.start_session(course_id, date, start, end).await {
            Ok(session) => to_json(&session),
            Err(ServiceError::Store(presence_store::StoreError::InvalidWindow { .. })) => Err(
                fdo::Error::InvalidArgs("session start must be before its end".into()),
            ),
            Err(err) => Err(internal(err)),
        }
    }

    /// Close a session. Returns false if it does not exist.
    async fn end_session(&self, session_id: i64) -> fdo::Result<bool> {
        tracing::info!(session_id, "end_session requested");
        self.service.end_session(session_id).await.map_err(internal)
    }

    /// Enroll (or re-enroll) an identity from a face image.
    async fn enroll(
        &self,
        identity_id: i64,
        role: &str,
        name: &str,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        tracing::info!(identity_id, role, name, "enroll requested");
        let role: Role = role.parse().map_err(fdo::Error::InvalidArgs)?;
        let outcome = self
            .service
            .enroll(identity_id, role, name, image)
            .await
            .map_err(internal)?;
        to_json(&outcome)
    }

    async fn list_attendance(&self, session_id: i64) -> fdo::Result<String> {
        let records = self
            .service
            .list_attendance(session_id)
            .await
            .map_err(internal)?;
        to_json(&records)
    }

    /// Enrolled students with no record for `session_id`.
    async fn list_absent(&self, session_id: i64) -> fdo::Result<String> {
        let absent = self
            .service
            .list_absent(session_id)
            .await
            .map_err(internal)?;
        let summary: Vec<IdentitySummary<'_>> = absent.iter().map(IdentitySummary::from).collect();
        to_json(&summary)
    }

    async fn list_history(&self, identity_id: i64) -> fdo::Result<String> {
        let records = self.service.history(identity_id).await.map_err(internal)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let settings = self.service.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "provider": self.provider,
            "database": self.db_path,
            "distance_threshold": settings.threshold.tau(),
            "late_grace_minutes": settings.policy.grace().num_minutes(),
            "extract_timeout_secs": settings.extract_timeout.as_secs(),
            "match_role": settings.match_role,
        })
        .to_string())
    }
}

/// Identity without its descriptor.
#[derive(Serialize)]
struct IdentitySummary<'a> {
    identity_id: i64,
    role: Role,
    name: &'a str,
}

impl<'a> From<&'a EnrolledIdentity> for IdentitySummary<'a> {
    fn from(identity: &'a EnrolledIdentity) -> Self {
        Self {
            identity_id: identity.identity_id,
            role: identity.role,
            name: &identity.name,
        }
    }
}

fn parse_time(value: &str) -> fdo::Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| fdo::Error::InvalidArgs(format!("time '{value}': {e}")))
}

/// Serialize `outcome` and add a one-line `summary` beside its own fields.
fn with_summary<T: Serialize>(outcome: &T, summary: String) -> fdo::Result<String> {
    let mut json = serde_json::to_value(outcome).map_err(encode)?;
    if let Value::Object(fields) = &mut json {
        fields.insert("summary".to_string(), Value::String(summary));
    }
    Ok(json.to_string())
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(encode)
}

fn encode(err: serde_json::Error) -> fdo::Error {
    fdo::Error::Failed(format!("failed to encode reply: {err}"))
}

fn internal(err: ServiceError) -> fdo::Error {
    tracing::error!(error = %err, "request failed");
    fdo::Error::Failed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::RecognitionOutcome;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("08:00").unwrap(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(
            parse_time("10:15:30").unwrap(),
            NaiveTime::from_hms_opt(10, 15, 30).unwrap()
        );
        assert!(matches!(parse_time("8am"), Err(fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_summary_keeps_outcome_message() {
        let outcome = RecognitionOutcome::InvalidImage {
            message: "image could not be decoded".into(),
        };
        let reply = with_summary(&outcome, outcome.message()).unwrap();
        let json: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["outcome"], "invalid_image");
        assert_eq!(json["message"], "image could not be decoded");
        assert_eq!(json["summary"], "invalid image: image could not be decoded");
    }

    #[test]
    fn test_identity_summary_omits_descriptor() {
        let identity = EnrolledIdentity {
            identity_id: 4,
            role: Role::Student,
            name: "Amina".into(),
            descriptor: Some(presence_core::Descriptor::new(vec![0.1, 0.2])),
        };
        let json = serde_json::to_value(IdentitySummary::from(&identity)).unwrap();
        assert_eq!(json, serde_json::json!({"identity_id": 4, "role": "student", "name": "Amina"}));
    }
}
