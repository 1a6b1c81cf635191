//! Attendance time-window policy.
//!
//! Maps the current instant against a session's start/end to a
//! [`WindowDecision`]. Refusals are explicit variants, never a null status.

use crate::types::{AttendanceStatus, Session};
use chrono::{Duration, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Grace period after session start during which arrivals count as present.
pub const LATE_GRACE_MINUTES: i64 = 30;

/// Upper bound for a configured grace period: one day.
pub const MAX_GRACE_MINUTES: i64 = 24 * 60;

/// Result of evaluating the attendance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowDecision {
    /// Before session start; recognition must not run.
    TooEarly,
    Present,
    Late,
    /// After session end; recognition must not run.
    TooLate,
}

impl WindowDecision {
    /// Status to record, or `None` when detection is refused.
    pub fn status(self) -> Option<AttendanceStatus> {
        match self {
            WindowDecision::Present => Some(AttendanceStatus::Present),
            WindowDecision::Late => Some(AttendanceStatus::Late),
            WindowDecision::TooEarly | WindowDecision::TooLate => None,
        }
    }

    pub fn allows_detection(self) -> bool {
        self.status().is_some()
    }
}

/// Fixed-grace window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    grace: Duration,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::with_grace_minutes(LATE_GRACE_MINUTES)
    }
}

impl WindowPolicy {
    /// Grace is clamped to `0..=MAX_GRACE_MINUTES`.
    pub fn with_grace_minutes(minutes: i64) -> Self {
        Self { grace: Duration::minutes(minutes.clamp(0, MAX_GRACE_MINUTES)) }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Decide on time-of-day alone.
    ///
    /// `start <= now <= start + grace` is present, `start + grace < now <= end` is late.
    /// Sessions crossing midnight are not supported.
    pub fn decide(&self, start: NaiveTime, end: NaiveTime, now: NaiveTime) -> WindowDecision {
        if now < start {
            return WindowDecision::TooEarly;
        }
        if now > end {
            return WindowDecision::TooLate;
        }
        let (cutoff, wrapped) = start.overflowing_add_signed(self.grace);
        // A cutoff that wraps past midnight covers the rest of the day.
        if wrapped != 0 || now <= cutoff {
            WindowDecision::Present
        } else {
            WindowDecision::Late
        }
    }

    /// Decide for `session` at instant `now`, honoring the session's calendar date.
    pub fn decide_at(&self, session: &Session, now: NaiveDateTime) -> WindowDecision {
        let today = now.date();
        if today < session.date {
            WindowDecision::TooEarly
        } else if today > session.date {
            WindowDecision::TooLate
        } else {
            self.decide(session.start_time, session.end_time, now.time())
        }
    }

    /// Instant after which arrivals are late.
    pub fn late_cutoff(&self, session: &Session) -> NaiveDateTime {
        session
            .starts_at()
            .checked_add_signed(self.grace)
            .unwrap_or(NaiveDateTime::MAX)
    }
}

/// Human-readable explanation of a window decision for `session`.
pub fn describe(decision: WindowDecision, session: &Session) -> String {
    match decision {
        WindowDecision::TooEarly => format!(
            "session starts on {} at {}",
            session.date,
            session.start_time.format("%H:%M")
        ),
        WindowDecision::TooLate => format!(
            "session ended on {} at {}",
            session.date,
            session.end_time.format("%H:%M")
        ),
        WindowDecision::Present => "present".to_string(),
        WindowDecision::Late => "late".to_string(),
    }
}

/// Source of the current local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock.
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
