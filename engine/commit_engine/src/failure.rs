//! Failure policies: when does an active enrollment become `failed`?
//!
//! The product never decided this, so the decision is injected. The engine
//! asks the policy on every submission and during sweeps; the policy itself
//! is a pure function of the enrollment and the clock.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Enrollment, EnrollmentStatus};

pub trait FailurePolicy: Send + Sync {
    /// `true` if `enrollment` should be closed as failed at `now`.
    fn is_overdue(&self, enrollment: &Enrollment, now: DateTime<Utc>) -> bool;

    fn name(&self) -> &'static str;
}

/// Enrollments stay active until completed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFail;

impl FailurePolicy for NeverFail {
    fn is_overdue(&self, _enrollment: &Enrollment, _now: DateTime<Utc>) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "never"
    }
}

/// Day `d` must be completed by `started_at + (d + 1) days + grace`.
#[derive(Debug, Clone, Copy)]
pub struct DailyDeadline {
    pub grace: Duration,
}

impl DailyDeadline {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Deadline for the currently open day, if the enrollment is still active.
    ///
    /// `None` as well when the deadline falls outside the representable range.
    pub fn deadline(&self, enrollment: &Enrollment) -> Option<DateTime<Utc>> {
        if enrollment.status != EnrollmentStatus::Active {
            return None;
        }
        let days = i64::from(enrollment.current_day) + 1;
        enrollment
            .started_at
            .checked_add_signed(Duration::days(days))?
            .checked_add_signed(self.grace)
    }
}

impl FailurePolicy for DailyDeadline {
    fn is_overdue(&self, enrollment: &Enrollment, now: DateTime<Utc>) -> bool {
        self.deadline(enrollment).is_some_and(|deadline| now > deadline)
    }

    fn name(&self) -> &'static str {
        "daily_deadline"
    }
}
