//! # Lifecycle controller
//!
//! [`ChallengeEngine`] owns creation, progression and closing of enrollments.
//!
//! ## Write discipline
//!
//! Every mutation is a read-validate-write cycle against the injected
//! [`EnrollmentStore`]. The write is conditioned on the version that was read;
//! on a conflict the whole cycle is repeated, so a retry re-runs the window,
//! duplicate and admission checks against fresh state. Two racing
//! submissions for the same enrollment therefore can never both be admitted
//! beyond the remaining capacity, and a day can only advance once.
//!
//! ## Suspension points
//!
//! `submit_unit_proof` awaits the store read, the verifier and the store
//! write. Nothing is applied before the final write, and the write itself is
//! all-or-nothing, so dropping the future at any point leaves no trace.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::admission::{check_admission, Admission};
use crate::catalog::{validate_stake, Catalog, ChallengeTemplate};
use crate::errors::{EngineError, Result, StoreError, ValidationError};
use crate::events::{EngineEvent, EventKind};
use crate::failure::{FailurePolicy, NeverFail};
use crate::storage::EnrollmentStore;
use crate::types::{
    DayProgress, Enrollment, EnrollmentId, EnrollmentStatus, Money, UnitProof,
};
use crate::verify::{AcceptAll, ProofVerifier, Verdict, VerificationRequest};

/// Backoff schedule for optimistic-write conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: StdDuration,
    pub max_backoff: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: StdDuration::from_millis(10),
            max_backoff: StdDuration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> StdDuration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Dashboard numbers for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
    /// Sum of stakes held by active enrollments.
    pub escrowed: Money,
    pub completed_days: u32,
}

pub struct ChallengeEngine {
    catalog: Arc<Catalog>,
    store: Arc<dyn EnrollmentStore>,
    verifier: Arc<dyn ProofVerifier>,
    failure_policy: Arc<dyn FailurePolicy>,
    retry: RetryPolicy,
}

impl ChallengeEngine {
    /// Engine with the [`AcceptAll`] verifier, the [`NeverFail`] policy and
    /// the default retry schedule.
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn EnrollmentStore>) -> Self {
        Self {
            catalog,
            store,
            verifier: Arc::new(AcceptAll),
            failure_policy: Arc::new(NeverFail),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ProofVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_failure_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ─────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────

    /// Commit `stake_amount` to a template tier and open day 0.
    ///
    /// Fails with `Validation` for an unknown selection or a stake outside the
    /// tier's range/increment, and with `AlreadyEnrolled` if the user already
    /// has an active enrollment for this template.
    pub async fn start_enrollment(
        &self,
        user_id: &str,
        template_id: &str,
        tier_id: &str,
        stake_amount: Money,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::MissingUser.into());
        }
        let (template, tier) = self.catalog.resolve(template_id, tier_id)?;
        validate_stake(tier, stake_amount)?;

        if let Some(existing) = self.store.find_active(user_id, template_id).await? {
            return Err(EngineError::AlreadyEnrolled {
                existing_id: Some(existing.id),
            });
        }

        let id = self.store.next_id().await?;
        let enrollment = Enrollment {
            id,
            user_id: user_id.to_string(),
            template_id: template.id.clone(),
            tier_id: tier.id.clone(),
            stake_amount,
            started_at: now,
            closed_at: None,
            status: EnrollmentStatus::Active,
            current_day: 0,
            days: (0..tier.duration_days)
                .map(|d| DayProgress::empty(d, tier.units_per_day))
                .collect(),
            version: 0,
        };
        let events =
            [EngineEvent::new(EventKind::EnrollmentStarted, id, user_id, now).with_amount(stake_amount)];

        match self.store.create(&enrollment, &events).await {
            Ok(()) => {}
            // Lost the race against a concurrent start for the same template.
            Err(StoreError::ActiveExists { .. }) => {
                return Err(EngineError::AlreadyEnrolled { existing_id: None })
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Enrollment {id} started: user={user_id} template={} tier={} stake={stake_amount} days={}",
            template.id,
            tier.id,
            tier.duration_days
        );
        Ok(enrollment)
    }

    // ─────────────────────────────────────────────────────────
    // Progression
    // ─────────────────────────────────────────────────────────

    /// Record one unit proof for the open day.
    ///
    /// On success the slot is filled, the day's completion is recomputed, and
    /// the enrollment advances (and possibly completes). Returns the updated
    /// day.
    pub async fn submit_unit_proof(
        &self,
        id: EnrollmentId,
        day_index: u32,
        unit_index: u32,
        proof_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<DayProgress> {
        let mut verified = false;
        let mut attempt = 0;

        loop {
            let mut enrollment = self.load(id).await?;

            if self.is_overdue(&enrollment, now) {
                // Close it first; the next pass reports `NotActive`.
                self.expire_if_overdue(id, now).await?;
                continue;
            }

            let template = self.template_for(&enrollment)?;
            check_submission(&enrollment, template, day_index, unit_index, now)?;

            if !verified {
                let request = VerificationRequest {
                    enrollment_id: id,
                    template_id: enrollment.template_id.clone(),
                    day_index,
                    unit_index,
                    proof_ref: proof_ref.to_string(),
                };
                if let Verdict::Rejected { reason } = self.verifier.verify(&request).await? {
                    info!("Enrollment {id}: proof for day {day_index} unit {unit_index} rejected: {reason}");
                    return Err(EngineError::ProofRejected { reason });
                }
                verified = true;
                // Verification may have taken a while; re-read before writing.
                continue;
            }

            let expected = enrollment.version;
            let events = apply_unit(&mut enrollment, day_index, unit_index, proof_ref, now);
            enrollment.version = expected + 1;

            match self.store.update(&enrollment, expected, &events).await {
                Ok(()) => {
                    log_progress(&enrollment, day_index, unit_index);
                    return enrollment
                        .days
                        .get(day_index as usize)
                        .cloned()
                        .ok_or_else(|| EngineError::Config(format!("enrollment {id} lost day {day_index}")));
                }
                Err(StoreError::Conflict { .. }) if attempt < self.retry.max_retries => {
                    debug!("Enrollment {id}: write conflict on attempt {attempt}, retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Enrollment {id}: write failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    /// Read-only projection for rendering.
    pub async fn get_enrollment_view(&self, id: EnrollmentId) -> Result<Enrollment> {
        self.load(id).await
    }

    // ─────────────────────────────────────────────────────────
    // Failure
    // ─────────────────────────────────────────────────────────

    /// Close `id` as failed if the failure policy says it is overdue at `now`.
    ///
    /// Returns the closed enrollment, or `None` when nothing changed.
    pub async fn expire_if_overdue(
        &self,
        id: EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        let mut attempt = 0;
        loop {
            let mut enrollment = self.load(id).await?;
            if !self.is_overdue(&enrollment, now) {
                return Ok(None);
            }

            let expected = enrollment.version;
            enrollment.status = EnrollmentStatus::Failed;
            enrollment.closed_at = Some(now);
            enrollment.version = expected + 1;
            let events = [EngineEvent::new(
                EventKind::EnrollmentFailed,
                id,
                &enrollment.user_id,
                now,
            )
            .with_day(enrollment.current_day)
            .with_amount(enrollment.stake_amount)];

            match self.store.update(&enrollment, expected, &events).await {
                Ok(()) => {
                    info!(
                        "Enrollment {id} failed by {} policy on day {}",
                        self.failure_policy.name(),
                        enrollment.current_day
                    );
                    return Ok(Some(enrollment));
                }
                Err(StoreError::Conflict { .. }) if attempt < self.retry.max_retries => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply [`Self::expire_if_overdue`] to every active enrollment.
    ///
    /// Per-enrollment failures are logged and skipped; returns the ids closed.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<Vec<EnrollmentId>> {
        let active = self.store.list_active().await?;
        let mut closed = Vec::new();
        for enrollment in active {
            if !self.is_overdue(&enrollment, now) {
                continue;
            }
            match self.expire_if_overdue(enrollment.id, now).await {
                Ok(Some(e)) => closed.push(e.id),
                Ok(None) => {}
                Err(e) => warn!("Sweep could not expire enrollment {}: {e}", enrollment.id),
            }
        }
        if !closed.is_empty() {
            info!("Sweep closed {} overdue enrollments", closed.len());
        }
        Ok(closed)
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub async fn list_enrollments(&self, user_id: &str) -> Result<Vec<Enrollment>> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    pub async fn user_summary(&self, user_id: &str) -> Result<UserSummary> {
        let enrollments = self.store.list_for_user(user_id).await?;
        Ok(enrollments
            .iter()
            .fold(UserSummary::default(), |mut summary, e| {
                match e.status {
                    EnrollmentStatus::Active => {
                        summary.active += 1;
                        summary.escrowed += e.stake_amount;
                    }
                    EnrollmentStatus::Completed => summary.completed += 1,
                    EnrollmentStatus::Failed => summary.failed += 1,
                }
                summary.completed_days += e.completed_days().len() as u32;
                summary
            }))
    }

    pub async fn enrollment_events(&self, id: EnrollmentId) -> Result<Vec<EngineEvent>> {
        self.load(id).await?;
        Ok(self.store.events_for(id).await?)
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    /// Only active enrollments can fail, whatever the policy says.
    fn is_overdue(&self, enrollment: &Enrollment, now: DateTime<Utc>) -> bool {
        enrollment.status == EnrollmentStatus::Active
            && self.failure_policy.is_overdue(enrollment, now)
    }

    async fn load(&self, id: EnrollmentId) -> Result<Enrollment> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    fn template_for(&self, enrollment: &Enrollment) -> Result<&ChallengeTemplate> {
        self.catalog
            .resolve(&enrollment.template_id, &enrollment.tier_id)
            .map(|(template, _)| template)
            .map_err(|e| EngineError::Config(format!("enrollment {}: {e}", enrollment.id)))
    }
}

/// Every check that must pass before a proof may be written.
fn check_submission(
    enrollment: &Enrollment,
    template: &ChallengeTemplate,
    day_index: u32,
    unit_index: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    if enrollment.status != EnrollmentStatus::Active {
        return Err(EngineError::NotActive {
            status: enrollment.status,
        });
    }
    if day_index != enrollment.current_day {
        return Err(EngineError::OutOfWindow {
            requested_day: day_index,
            current_day: enrollment.current_day,
        });
    }

    let day = enrollment.open_day().ok_or_else(|| {
        EngineError::Config(format!(
            "enrollment {} is active but has no day {}",
            enrollment.id, enrollment.current_day
        ))
    })?;

    match day.slot(unit_index) {
        None => {
            return Err(ValidationError::UnitOutOfRange {
                unit_index,
                units_per_day: day.units_per_day(),
            }
            .into())
        }
        Some(Some(existing)) => {
            return Err(EngineError::DuplicateSubmission {
                day_index,
                unit_index,
                existing: existing.clone(),
            })
        }
        Some(None) => {}
    }

    if let Some(rule) = &template.pacing {
        if let Admission::Denied {
            reason,
            retry_after,
        } = check_admission(day, now, rule)
        {
            debug!(
                "Enrollment {}: unit {unit_index} denied ({reason}), retry in {}s",
                enrollment.id,
                retry_after.num_seconds()
            );
            return Err(EngineError::RateLimited {
                reason,
                retry_after,
            });
        }
    }
    Ok(())
}

/// Fill the slot and advance the enrollment. Returns the events to persist.
fn apply_unit(
    enrollment: &mut Enrollment,
    day_index: u32,
    unit_index: u32,
    proof_ref: &str,
    now: DateTime<Utc>,
) -> Vec<EngineEvent> {
    let id = enrollment.id;
    let user_id = enrollment.user_id.clone();
    let mut events = vec![EngineEvent::new(EventKind::UnitAccepted, id, &user_id, now)
        .with_day(day_index)
        .with_unit(unit_index)];

    let day_completed = match enrollment.days.get_mut(day_index as usize) {
        Some(day) => day.fill(
            unit_index,
            UnitProof {
                submitted_at: now,
                proof_ref: proof_ref.to_string(),
            },
        ),
        None => false,
    };

    if day_completed {
        events.push(EngineEvent::new(EventKind::DayCompleted, id, &user_id, now).with_day(day_index));
        enrollment.current_day += 1;
        if enrollment.current_day == enrollment.duration_days() {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.closed_at = Some(now);
            events.push(
                EngineEvent::new(EventKind::EnrollmentCompleted, id, &user_id, now)
                    .with_amount(enrollment.stake_amount),
            );
        }
    }
    events
}

fn log_progress(enrollment: &Enrollment, day_index: u32, unit_index: u32) {
    match enrollment.status {
        EnrollmentStatus::Completed => info!(
            "Enrollment {} completed after {} days",
            enrollment.id,
            enrollment.duration_days()
        ),
        _ if enrollment.current_day > day_index => {
            info!("Enrollment {}: day {day_index} completed", enrollment.id)
        }
        _ => debug!(
            "Enrollment {}: day {day_index} unit {unit_index} accepted",
            enrollment.id
        ),
    }
}
