//! presence-core — face matching and attendance decision logic.
//!
//! Nearest-neighbor identity matching over enrolled descriptors, the
//! present/late window policy, and the seam to the external embedding
//! provider. No I/O beyond image decoding.

pub mod extractor;
pub mod matcher;
pub mod policy;
pub mod types;

pub use extractor::{
    decode_image, EmbeddingProvider, FaceCandidate, FaceGate, NoFaceReason, ProviderError,
    MIN_FACE_CONFIDENCE, MIN_FACE_SIZE_PX,
};
pub use matcher::{
    identify, DistanceThreshold, LinearScanMatcher, MatchOutcome, Matcher, Nearest,
    DEFAULT_DISTANCE_THRESHOLD,
};
pub use policy::{
    Clock, FixedClock, SystemClock, WindowDecision, WindowPolicy, LATE_GRACE_MINUTES,
    MAX_GRACE_MINUTES,
};
pub use types::{
    AttendanceRecord, AttendanceStatus, BoundingBox, Descriptor, EnrolledIdentity, Role, Session,
};
