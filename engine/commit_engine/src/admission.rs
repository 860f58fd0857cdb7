//! # Admission control
//!
//! Decides whether one more unit proof may be accepted for a day right now.
//!
//! Two independent limits apply, both configured per template through a
//! [`PacingRule`]:
//!
//! 1. **Spacing**: at least `min_interval_minutes` since the most recent
//!    proof of the day.
//! 2. **Hourly cap**: fewer than `max_per_hour` proofs in the trailing
//!    window `(now - 60min, now]`.
//!
//! The first proof of a day is always admitted. Checks run in that order and
//! the first failing one determines the denial and its `retry_after`.
//!
//! This module is pure: no clock, no storage, no logging.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DayProgress;

/// Pacing parameters for templates that split a day into several units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingRule {
    pub min_interval_minutes: u32,
    pub max_per_hour: u32,
}

impl PacingRule {
    pub fn min_interval(&self) -> Duration {
        Duration::minutes(i64::from(self.min_interval_minutes))
    }
}

/// Why a submission was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MinimumInterval,
    HourlyCap,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinimumInterval => f.write_str("minimum interval not elapsed"),
            Self::HourlyCap => f.write_str("hourly cap reached"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied {
        reason: DenyReason,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Length of the trailing window used by the hourly cap.
pub fn hourly_window() -> Duration {
    Duration::minutes(60)
}

/// Evaluate `rule` against the proofs already accepted for `day`.
pub fn check_admission(day: &DayProgress, now: DateTime<Utc>, rule: &PacingRule) -> Admission {
    let Some(last) = day.last_submission() else {
        return Admission::Admitted;
    };

    let elapsed = now - last.submitted_at;
    let min_interval = rule.min_interval();
    if elapsed < min_interval {
        return Admission::Denied {
            reason: DenyReason::MinimumInterval,
            retry_after: min_interval - elapsed,
        };
    }

    let window_start = now - hourly_window();
    let in_window: Vec<DateTime<Utc>> = day
        .submissions()
        .map(|p| p.submitted_at)
        .filter(|t| *t > window_start && *t <= now)
        .collect();

    if in_window.len() as u32 >= rule.max_per_hour {
        // The cap frees up when the oldest in-window proof reaches the window edge.
        let oldest = in_window.iter().min().copied().unwrap_or(now);
        return Admission::Denied {
            reason: DenyReason::HourlyCap,
            retry_after: oldest + hourly_window() - now,
        };
    }

    Admission::Admitted
}
