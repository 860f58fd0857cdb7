//! Audit events appended atomically with every enrollment write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EnrollmentId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A user committed a stake and the enrollment was created.
    EnrollmentStarted,
    /// A unit proof was verified and written into its slot.
    UnitAccepted,
    /// The last empty slot of a day was filled.
    DayCompleted,
    /// The final day completed; stake is due back with bonus.
    EnrollmentCompleted,
    /// The failure policy closed the enrollment.
    EnrollmentFailed,
}

impl EventKind {
    /// Short identifier suitable for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnrollmentStarted => "enrollment_started",
            Self::UnitAccepted => "unit_accepted",
            Self::DayCompleted => "day_completed",
            Self::EnrollmentCompleted => "enrollment_completed",
            Self::EnrollmentFailed => "enrollment_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enrollment_started" => Some(Self::EnrollmentStarted),
            "unit_accepted" => Some(Self::UnitAccepted),
            "day_completed" => Some(Self::DayCompleted),
            "enrollment_completed" => Some(Self::EnrollmentCompleted),
            "enrollment_failed" => Some(Self::EnrollmentFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub enrollment_id: EnrollmentId,
    pub user_id: String,
    pub day_index: Option<u32>,
    pub unit_index: Option<u32>,
    /// Stake amount, on start/completion/failure events.
    pub amount: Option<Money>,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub(crate) fn new(
        kind: EventKind,
        enrollment_id: EnrollmentId,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            enrollment_id,
            user_id: user_id.to_string(),
            day_index: None,
            unit_index: None,
            amount: None,
            at,
        }
    }

    pub(crate) fn with_day(mut self, day_index: u32) -> Self {
        self.day_index = Some(day_index);
        self
    }

    pub(crate) fn with_unit(mut self, unit_index: u32) -> Self {
        self.unit_index = Some(unit_index);
        self
    }

    pub(crate) fn with_amount(mut self, amount: Money) -> Self {
        self.amount = Some(amount);
        self
    }
}
