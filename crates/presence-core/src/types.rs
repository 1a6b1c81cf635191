use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face descriptor produced by the embedding provider (typically 512-dimensional).
///
/// Two descriptors are comparable only when their lengths match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to `other`, accumulated in f64.
    ///
    /// Returns `None` when the shapes differ.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Option<f64> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum();
        Some(sum.sqrt())
    }

    /// Little-endian f32 blob, the on-disk representation.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a little-endian f32 blob. Returns `None` for empty or truncated blobs.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// Kind of enrolled person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// An enrolled student or teacher as seen by the matcher.
///
/// `descriptor` is `None` when the identity has no usable stored descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: i64,
    pub role: Role,
    pub name: String,
    pub descriptor: Option<Descriptor>,
}

/// One concrete occurrence of a scheduled course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub course_id: i64,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_open: bool,
}

impl Session {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end_time)
    }
}

/// Attendance status. Wire values are lowercase English.
///
/// `Absent` is never persisted: it is the complement of the recorded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// A persisted attendance record. At most one exists per (session, identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: i64,
    pub session_id: i64,
    pub identity_id: i64,
    pub status: AttendanceStatus,
    pub confidence: f64,
    pub recorded_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), Some(5.0));
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Descriptor::new(vec![0.25, -1.5, 3.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_shape_mismatch() {
        let a = Descriptor::new(vec![1.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_blob_roundtrip() {
        let d = Descriptor::new(vec![0.5, -0.25, 1e-3]);
        let bytes = d.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Descriptor::from_le_bytes(&bytes), Some(d));
    }

    #[test]
    fn test_blob_truncated_rejected() {
        assert_eq!(Descriptor::from_le_bytes(&[0, 0, 128]), None);
        assert_eq!(Descriptor::from_le_bytes(&[]), None);
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(
            serde_json::to_string(&AttendanceStatus::Late).unwrap(),
            "\"late\""
        );
        assert_eq!("present".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert!("retard".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("teacher".parse::<Role>(), Ok(Role::Teacher));
        assert!("admin".parse::<Role>().is_err());
    }
}
