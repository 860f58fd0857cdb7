//! Engine-wide error types.
//!
//! Every failure of a lifecycle operation is a typed outcome. Only
//! [`EngineError::Config`] signals a programmer error (the catalog no longer
//! knows a template or tier an enrollment refers to); everything else is an
//! expected result the caller surfaces to the user.

use chrono::Duration;
use thiserror::Error;

use crate::admission::DenyReason;
use crate::types::{EnrollmentId, EnrollmentStatus, Money, UnitProof};

/// Locally recoverable input problems. The user corrects the input; no retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown challenge template: {0}")]
    UnknownTemplate(String),

    #[error("unknown difficulty tier {tier_id} for template {template_id}")]
    UnknownTier {
        template_id: String,
        tier_id: String,
    },

    #[error("stake out of range: {amount} not in [{min}, {max}]")]
    StakeOutOfRange { amount: Money, min: Money, max: Money },

    #[error("stake {amount} is not a multiple of {step}")]
    StakeOffStep { amount: Money, step: Money },

    #[error("stake {amount} is too large to quote")]
    QuoteOverflow { amount: Money },

    #[error("user id is required")]
    MissingUser,

    #[error("unit index {unit_index} out of range (day has {units_per_day} units)")]
    UnitOutOfRange { unit_index: u32, units_per_day: u32 },
}

/// Malformed tier/template tables, rejected when a [`crate::Catalog`] is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate template id: {0}")]
    DuplicateTemplate(String),

    #[error("template {0} has no tiers")]
    NoTiers(String),

    #[error("template {template_id}: duplicate tier id {tier_id}")]
    DuplicateTier {
        template_id: String,
        tier_id: String,
    },

    #[error("template {template_id}, tier {tier_id}: {reason}")]
    InvalidTier {
        template_id: String,
        tier_id: String,
        reason: String,
    },

    #[error("template {template_id}: {reason}")]
    InvalidPacing { template_id: String, reason: String },

    #[error("catalog JSON error: {0}")]
    Json(String),
}

/// Failures of an [`crate::EnrollmentStore`] round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The stored version moved since it was read.
    #[error("write conflict on enrollment {id} (expected version {expected})")]
    Conflict { id: EnrollmentId, expected: u64 },

    #[error("enrollment {0} not found in store")]
    NotFound(EnrollmentId),

    /// Another enrollment for the same `(user, template)` is already active.
    #[error("user {user_id} already has an active {template_id} enrollment")]
    ActiveExists { user_id: String, template_id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures of the external verification oracle (not a verdict).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("verification service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed verification response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The caller targeted a day other than the open one (stale client state).
    #[error("day {requested_day} is not open for uploads (current day is {current_day})")]
    OutOfWindow { requested_day: u32, current_day: u32 },

    /// The slot is already filled; the existing proof is returned for display.
    #[error("unit {unit_index} of day {day_index} already has a proof")]
    DuplicateSubmission {
        day_index: u32,
        unit_index: u32,
        existing: UnitProof,
    },

    #[error("{reason}; retry after {}s", .retry_after.num_seconds())]
    RateLimited {
        reason: DenyReason,
        retry_after: Duration,
    },

    #[error("enrollment is {status}, not active")]
    NotActive { status: EnrollmentStatus },

    #[error("an active enrollment already exists for this template ({existing_id:?})")]
    AlreadyEnrolled { existing_id: Option<EnrollmentId> },

    #[error("enrollment {0} not found")]
    NotFound(EnrollmentId),

    #[error("proof rejected: {reason}")]
    ProofRejected { reason: String },

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Catalog and stored data disagree; never silently defaulted.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable tag for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::OutOfWindow { .. } => "out_of_window",
            Self::DuplicateSubmission { .. } => "duplicate_submission",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotActive { .. } => "not_active",
            Self::AlreadyEnrolled { .. } => "already_enrolled",
            Self::NotFound(_) => "not_found",
            Self::ProofRejected { .. } => "proof_rejected",
            Self::Verification(_) => "verification_unavailable",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
