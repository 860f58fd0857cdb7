//! Proof verification backends.
//!
//! ## Resilience
//!
//! * [`HttpVerifier`] applies exponential back-off when the oracle is
//!   unreachable, rate-limits us (429) or answers 5xx, up to
//!   [`MAX_BACKOFF_MS`] between attempts and `max_attempts` in total.
//! * Any other non-success status, or a body that is not a verdict, is
//!   reported immediately.
//!
//! Both verifiers are plain futures; dropping the submission cancels the
//! in-flight request or sleep.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use commit_engine::{ProofVerifier, Verdict, VerificationRequest, VerifyError};

const MAX_BACKOFF_MS: u64 = 5_000;
const INITIAL_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

// ─────────────────────────────────────────────────────────
// Oracle wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct VerifyBody<'a> {
    enrollment_id: u64,
    template_id: &'a str,
    day_index: u32,
    unit_index: u32,
    proof_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl From<VerifyResponse> for Verdict {
    fn from(resp: VerifyResponse) -> Self {
        if resp.accepted {
            Verdict::Accepted
        } else {
            Verdict::Rejected {
                reason: resp
                    .reason
                    .unwrap_or_else(|| "proof did not pass verification".to_string()),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// HTTP oracle
// ─────────────────────────────────────────────────────────

pub struct HttpVerifier {
    client: Client,
    url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpVerifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_backoff(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }
}

#[async_trait]
impl ProofVerifier for HttpVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        let body = VerifyBody {
            enrollment_id: request.enrollment_id,
            template_id: &request.template_id,
            day_index: request.day_index,
            unit_index: request.unit_index,
            proof_ref: &request.proof_ref,
        };
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
            }

            let resp = match self.client.post(&self.url).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Verifier request failed (attempt {attempt}/{}): {e}", self.max_attempts);
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                warn!("Verifier answered {status} (attempt {attempt}/{})", self.max_attempts);
                last_error = format!("verifier answered {status}");
                continue;
            }
            if !status.is_success() {
                return Err(VerifyError::Unavailable(format!("verifier answered {status}")));
            }

            let verdict: VerifyResponse = resp
                .json()
                .await
                .map_err(|e| VerifyError::Malformed(e.to_string()))?;
            debug!(
                "Verifier verdict for enrollment {} day {} unit {}: accepted={}",
                request.enrollment_id, request.day_index, request.unit_index, verdict.accepted
            );
            return Ok(verdict.into());
        }

        Err(VerifyError::Unavailable(last_error))
    }
}

// ─────────────────────────────────────────────────────────
// Simulated oracle
// ─────────────────────────────────────────────────────────

/// Waits `delay`, then accepts. Stands in for the manual review step.
pub struct SimulatedVerifier {
    delay: Duration,
}

impl SimulatedVerifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ProofVerifier for SimulatedVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        tokio::time::sleep(self.delay).await;
        debug!(
            "Simulated verification passed for enrollment {} ({})",
            request.enrollment_id, request.proof_ref
        );
        Ok(Verdict::Accepted)
    }
}
