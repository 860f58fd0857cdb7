//! # Types
//!
//! Data model shared by every module of the engine.
//!
//! ## Status as a Finite-State Machine
//!
//! [`EnrollmentStatus`] is forward-only:
//!
//! ```text
//! Active ──► Completed
//!    └─────► Failed
//! ```
//!
//! Both `Completed` and `Failed` are terminal. Nothing in the engine moves an
//! enrollment out of a terminal state.
//!
//! ## Slots
//!
//! A [`DayProgress`] holds exactly `units_per_day` slots. A slot is either
//! empty (`None`) or holds an immutable [`UnitProof`]. Slots are never cleared.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whole currency units (the product quotes stakes in rupees).
pub type Money = i64;

/// Store-assigned enrollment identifier.
pub type EnrollmentId = u64;

/// Lifecycle status of an enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Accepting proof submissions.
    Active,
    /// Every day satisfied; stake returned plus bonus by the external ledger.
    Completed,
    /// Window exceeded without completion.
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Short identifier used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted proof filling one unit slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProof {
    pub submitted_at: DateTime<Utc>,
    /// Opaque handle supplied by proof capture (never interpreted here).
    pub proof_ref: String,
}

/// Completion record for a single day of an enrollment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayProgress {
    pub day_index: u32,
    pub units: Vec<Option<UnitProof>>,
    /// `true` iff every slot in `units` is filled.
    pub completed: bool,
}

impl DayProgress {
    pub fn empty(day_index: u32, units_per_day: u32) -> Self {
        Self {
            day_index,
            units: vec![None; units_per_day as usize],
            completed: false,
        }
    }

    pub fn units_per_day(&self) -> u32 {
        self.units.len() as u32
    }

    pub fn filled_count(&self) -> u32 {
        self.units.iter().filter(|u| u.is_some()).count() as u32
    }

    /// Iterate over the proofs already accepted for this day.
    pub fn submissions(&self) -> impl Iterator<Item = &UnitProof> {
        self.units.iter().flatten()
    }

    /// The proof with the latest `submitted_at`, regardless of slot position.
    pub fn last_submission(&self) -> Option<&UnitProof> {
        self.submissions().max_by_key(|p| p.submitted_at)
    }

    pub fn slot(&self, unit_index: u32) -> Option<&Option<UnitProof>> {
        self.units.get(unit_index as usize)
    }

    /// Write `proof` into an empty slot and recompute `completed`.
    ///
    /// Returns `true` when this write flipped the day to completed.
    pub(crate) fn fill(&mut self, unit_index: u32, proof: UnitProof) -> bool {
        let was_completed = self.completed;
        if let Some(slot) = self.units.get_mut(unit_index as usize) {
            if slot.is_none() {
                *slot = Some(proof);
            }
        }
        self.completed = self.units.iter().all(Option::is_some);
        self.completed && !was_completed
    }
}

/// A user's attempt at one challenge template and tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub user_id: String,
    pub template_id: String,
    pub tier_id: String,
    pub stake_amount: Money,
    pub started_at: DateTime<Utc>,
    /// Set when the enrollment reaches a terminal status.
    pub closed_at: Option<DateTime<Utc>>,
    pub status: EnrollmentStatus,
    /// Index of the only day that accepts uploads; equals `days.len()` once done.
    pub current_day: u32,
    pub days: Vec<DayProgress>,
    /// Optimistic-concurrency version, bumped on every write.
    pub version: u64,
}

impl Enrollment {
    pub fn duration_days(&self) -> u32 {
        self.days.len() as u32
    }

    /// Indices of all completed days, in order.
    pub fn completed_days(&self) -> Vec<u32> {
        self.days
            .iter()
            .filter(|d| d.completed)
            .map(|d| d.day_index)
            .collect()
    }

    /// The day currently open for uploads, if any.
    pub fn open_day(&self) -> Option<&DayProgress> {
        if self.status != EnrollmentStatus::Active {
            return None;
        }
        self.days.get(self.current_day as usize)
    }
}
