use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::invariants::assert_all_enrollment_invariants;
use crate::{
    Catalog, ChallengeEngine, EngineError, EngineEvent, Enrollment, EnrollmentId,
    EnrollmentStore, EventKind, MemoryStore, ProofVerifier, RetryPolicy, StoreError, Verdict,
    VerificationRequest, VerifyError,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff: StdDuration::from_millis(1),
        max_backoff: StdDuration::from_millis(5),
    }
}

/// Holds every verification open long enough for racing calls to overlap.
struct SlowVerifier(StdDuration);

#[async_trait]
impl ProofVerifier for SlowVerifier {
    async fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        tokio::time::sleep(self.0).await;
        Ok(Verdict::Accepted)
    }
}

/// Memory store whose first `conflicts` updates report a version conflict.
struct FlakyStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
}

impl FlakyStore {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl EnrollmentStore for FlakyStore {
    async fn next_id(&self) -> Result<EnrollmentId, StoreError> {
        self.inner.next_id().await
    }

    async fn create(
        &self,
        enrollment: &Enrollment,
        events: &[EngineEvent],
    ) -> Result<(), StoreError> {
        self.inner.create(enrollment, events).await
    }

    async fn get(&self, id: EnrollmentId) -> Result<Option<Enrollment>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<Enrollment>, StoreError> {
        self.inner.find_active(user_id, template_id).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Enrollment>, StoreError> {
        self.inner.list_for_user(user_id).await
    }

    async fn list_active(&self) -> Result<Vec<Enrollment>, StoreError> {
        self.inner.list_active().await
    }

    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: u64,
        events: &[EngineEvent],
    ) -> Result<(), StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Conflict {
                id: enrollment.id,
                expected: expected_version,
            });
        }
        self.inner.update(enrollment, expected_version, events).await
    }

    async fn events_for(&self, id: EnrollmentId) -> Result<Vec<EngineEvent>, StoreError> {
        self.inner.events_for(id).await
    }
}

fn slow_engine() -> ChallengeEngine {
    ChallengeEngine::new(Arc::new(Catalog::builtin()), Arc::new(MemoryStore::new()))
        .with_verifier(Arc::new(SlowVerifier(StdDuration::from_millis(20))))
        .with_retry_policy(fast_retry())
}

#[tokio::test]
async fn test_double_tap_on_same_glass_admits_once() {
    let engine = slow_engine();
    let e = engine
        .start_enrollment("ana", "water", "medium", 300, t0())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.submit_unit_proof(e.id, 0, 0, "tap-a", t0()),
        engine.submit_unit_proof(e.id, 0, 0, "tap-b", t0()),
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser,
        Err(EngineError::DuplicateSubmission { unit_index: 0, .. })
    ));

    let view = engine.get_enrollment_view(e.id).await.unwrap();
    assert_eq!(view.days[0].filled_count(), 1);
    assert_all_enrollment_invariants(&view);
}

#[tokio::test]
async fn test_racing_glasses_respect_interval() {
    let engine = slow_engine();
    let e = engine
        .start_enrollment("ana", "water", "medium", 300, t0())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.submit_unit_proof(e.id, 0, 3, "glass-3", t0()),
        engine.submit_unit_proof(e.id, 0, 4, "glass-4", t0()),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(EngineError::RateLimited { .. })));
    assert_eq!(
        engine.get_enrollment_view(e.id).await.unwrap().days[0].filled_count(),
        1
    );
}

#[tokio::test]
async fn test_racing_final_unit_advances_day_once() {
    let engine = slow_engine();
    let e = engine
        .start_enrollment("ben", "book", "medium", 500, t0())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.submit_unit_proof(e.id, 0, 0, "phone", t0()),
        engine.submit_unit_proof(e.id, 0, 0, "laptop", t0()),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let view = engine.get_enrollment_view(e.id).await.unwrap();
    assert_eq!(view.current_day, 1);
    assert_all_enrollment_invariants(&view);

    let events = engine.enrollment_events(e.id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|ev| ev.kind == EventKind::DayCompleted)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_concurrent_starts_create_one_enrollment() {
    let engine = slow_engine();
    let (a, b) = tokio::join!(
        engine.start_enrollment("cleo", "running", "easy", 150, t0()),
        engine.start_enrollment("cleo", "running", "hard", 500, t0()),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(EngineError::AlreadyEnrolled { .. })));
    assert_eq!(engine.list_enrollments("cleo").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_retry_policy(fast_retry());
    let e = engine
        .start_enrollment("dora", "book", "medium", 500, t0())
        .await
        .unwrap();

    let day = engine
        .submit_unit_proof(e.id, 0, 0, "proof", t0())
        .await
        .unwrap();
    assert!(day.completed);
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_persistent_conflicts_surface_as_storage_error() {
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_retry_policy(fast_retry());
    let e = engine
        .start_enrollment("dora", "book", "medium", 500, t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "proof", t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Storage(StoreError::Conflict { .. })
    ));
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), e);
}

#[tokio::test]
async fn test_cancelled_submission_applies_nothing() {
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), Arc::new(MemoryStore::new()))
        .with_verifier(Arc::new(SlowVerifier(StdDuration::from_secs(10))));
    let e = engine
        .start_enrollment("eli", "book", "medium", 500, t0())
        .await
        .unwrap();

    let outcome = tokio::time::timeout(
        StdDuration::from_millis(50),
        engine.submit_unit_proof(e.id, 0, 0, "proof", t0()),
    )
    .await;
    assert!(outcome.is_err(), "submission should still be verifying");

    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), e);
    assert_eq!(engine.enrollment_events(e.id).await.unwrap().len(), 1);
}
