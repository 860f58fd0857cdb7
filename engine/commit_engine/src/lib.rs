//! # Commit Engine
//!
//! Core of the habit-challenge portal: a user commits a stake to a challenge
//! tier, uploads proof day by day (optionally several paced units per day),
//! and the enrollment completes once every day is satisfied.
//!
//! | Phase        | Entry Point(s)                                              |
//! |--------------|-------------------------------------------------------------|
//! | Catalog      | [`Catalog::builtin`], [`Catalog::from_json`], [`validate_stake`], [`quote`] |
//! | Enrollment   | [`ChallengeEngine::start_enrollment`]                       |
//! | Progress     | [`ChallengeEngine::submit_unit_proof`]                      |
//! | Failure      | [`ChallengeEngine::expire_if_overdue`], [`ChallengeEngine::sweep_overdue`] |
//! | Queries      | `get_enrollment_view`, `list_enrollments`, `user_summary`, `enrollment_events` |
//!
//! ## Architecture
//!
//! Admission control ([`admission`]) and the tier table ([`catalog`]) are
//! pure. The lifecycle controller ([`lifecycle`]) reaches the outside world
//! only through three injected seams:
//!
//! - [`EnrollmentStore`]: persistence with version-checked writes.
//! - [`ProofVerifier`]: accept/reject verdicts for uploaded proofs.
//! - [`FailurePolicy`]: when an active enrollment counts as failed.
//!
//! There are no globals; the clock is an explicit `now` argument.

pub mod admission;
pub mod catalog;
pub mod errors;
pub mod events;
pub mod failure;
pub mod lifecycle;
pub mod storage;
pub mod types;
pub mod verify;

#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_lifecycle;

pub use admission::{check_admission, Admission, DenyReason, PacingRule};
pub use catalog::{quote, validate_stake, Catalog, ChallengeTemplate, DifficultyTier, StakeQuote};
pub use errors::{CatalogError, EngineError, StoreError, ValidationError, VerifyError};
pub use events::{EngineEvent, EventKind};
pub use failure::{DailyDeadline, FailurePolicy, NeverFail};
pub use lifecycle::{ChallengeEngine, RetryPolicy, UserSummary};
pub use storage::{EnrollmentStore, MemoryStore};
pub use types::{
    DayProgress, Enrollment, EnrollmentId, EnrollmentStatus, Money, UnitProof,
};
pub use verify::{AcceptAll, ProofVerifier, Verdict, VerificationRequest};
