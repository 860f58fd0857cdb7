//! Proof verification seam.
//!
//! The engine never interprets a proof. Before a unit slot is written it asks
//! a [`ProofVerifier`] for a verdict. The call is an ordinary future: if the
//! caller drops it (user navigated away), nothing has been written yet.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::VerifyError;
use crate::types::EnrollmentId;

/// What the oracle is asked to judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub enrollment_id: EnrollmentId,
    pub template_id: String,
    pub day_index: u32,
    pub unit_index: u32,
    pub proof_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
}

#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict, VerifyError>;
}

/// Accepts every proof immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ProofVerifier for AcceptAll {
    async fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        Ok(Verdict::Accepted)
    }
}
