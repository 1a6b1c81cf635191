//! Nearest-neighbor identity matching over enrolled descriptors.

use crate::types::{Descriptor, EnrolledIdentity, Role};
use serde::{Deserialize, Serialize};

/// Euclidean distance above which a nearest neighbor is rejected.
pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.9;

/// Nearest enrolled identity for a probe.
///
/// `distance` is `f64::INFINITY` when no candidate had a comparable descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Nearest<'a> {
    pub best: Option<&'a EnrolledIdentity>,
    pub distance: f64,
}

impl Nearest<'_> {
    /// True when at least one candidate was actually compared.
    pub fn has_comparison(&self) -> bool {
        self.best.is_some() && self.distance.is_finite()
    }
}

/// Strategy for finding the closest enrolled identity to a probe descriptor.
///
/// Implementations must keep first-minimum tie-breaking in candidate order.
pub trait Matcher {
    fn nearest<'a>(&self, probe: &Descriptor, candidates: &'a [EnrolledIdentity]) -> Nearest<'a>;
}

/// Exhaustive linear scan. O(N·D) per probe.
pub struct LinearScanMatcher;

impl Matcher for LinearScanMatcher {
    fn nearest<'a>(&self, probe: &Descriptor, candidates: &'a [EnrolledIdentity]) -> Nearest<'a> {
        let mut best: Option<&'a EnrolledIdentity> = None;
        let mut best_distance = f64::INFINITY;

        if probe.is_empty() {
            return Nearest { best, distance: best_distance };
        }

        for candidate in candidates {
            let Some(stored) = candidate.descriptor.as_ref() else {
                continue;
            };
            // Shape mismatch is skipped, never fatal: one malformed row must not abort the scan.
            let Some(distance) = probe.euclidean_distance(stored) else {
                tracing::debug!(
                    identity_id = candidate.identity_id,
                    expected = probe.len(),
                    got = stored.len(),
                    "descriptor shape mismatch, skipping"
                );
                continue;
            };
            // Strict `<` keeps the first candidate on ties.
            if distance < best_distance {
                best_distance = distance;
                best = Some(candidate);
            }
        }

        Nearest { best, distance: best_distance }
    }
}

/// Acceptance threshold and confidence mapping for a distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceThreshold {
    tau: f64,
}

impl Default for DistanceThreshold {
    fn default() -> Self {
        Self { tau: DEFAULT_DISTANCE_THRESHOLD }
    }
}

impl DistanceThreshold {
    /// Non-positive or non-finite values fall back to the default.
    pub fn new(tau: f64) -> Self {
        if tau.is_finite() && tau > 0.0 {
            Self { tau }
        } else {
            Self::default()
        }
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Rejection is strictly `distance > tau`; equality is accepted.
    pub fn accepts(&self, distance: f64) -> bool {
        distance.is_finite() && distance <= self.tau
    }

    /// `1 - distance/tau`, clamped to [0, 1]. Only meaningful for accepted distances.
    pub fn confidence(&self, distance: f64) -> f64 {
        (1.0 - distance / self.tau).clamp(0.0, 1.0)
    }
}

/// Thresholded match decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        identity_id: i64,
        role: Role,
        name: String,
        distance: f64,
        confidence: f64,
    },
    /// `distance` is `None` when nothing was comparable.
    Unrecognized { distance: Option<f64> },
}

/// Run `matcher` and apply `threshold` to its nearest neighbor.
pub fn identify<M: Matcher + ?Sized>(
    matcher: &M,
    probe: &Descriptor,
    candidates: &[EnrolledIdentity],
    threshold: DistanceThreshold,
) -> MatchOutcome {
    let nearest = matcher.nearest(probe, candidates);

    match nearest.best {
        Some(identity) if threshold.accepts(nearest.distance) => MatchOutcome::Matched {
            identity_id: identity.identity_id,
            role: identity.role,
            name: identity.name.clone(),
            distance: nearest.distance,
            confidence: threshold.confidence(nearest.distance),
        },
        _ => MatchOutcome::Unrecognized {
            distance: nearest.has_comparison().then_some(nearest.distance),
        },
    }
}
