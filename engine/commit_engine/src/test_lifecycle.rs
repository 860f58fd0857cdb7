use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::invariants::{assert_all_enrollment_invariants, assert_step_invariants};
use crate::{
    Catalog, ChallengeEngine, ChallengeTemplate, DailyDeadline, DenyReason, DifficultyTier,
    EngineError, Enrollment, EnrollmentStatus, EventKind, FailurePolicy, MemoryStore,
    PacingRule, ProofVerifier, ValidationError, Verdict, VerificationRequest, VerifyError,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
}

fn setup() -> (ChallengeEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store.clone());
    (engine, store)
}

struct RejectAll;

#[async_trait]
impl ProofVerifier for RejectAll {
    async fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        Ok(Verdict::Rejected {
            reason: "blurry photo".to_string(),
        })
    }
}

struct Offline;

#[async_trait]
impl ProofVerifier for Offline {
    async fn verify(&self, _request: &VerificationRequest) -> Result<Verdict, VerifyError> {
        Err(VerifyError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_seven_day_challenge_end_to_end() {
    let (engine, _) = setup();
    let enrollment = engine
        .start_enrollment("alice", "book", "medium", 500, t0())
        .await
        .unwrap();

    assert_eq!(enrollment.current_day, 0);
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.days.len(), 7);
    assert!(enrollment
        .days
        .iter()
        .all(|d| d.units == vec![None] && !d.completed));
    assert_all_enrollment_invariants(&enrollment);

    let mut before = enrollment.clone();
    for day in 0..7u32 {
        let now = t0() + Duration::days(i64::from(day)) + Duration::hours(2);
        let progress = engine
            .submit_unit_proof(enrollment.id, day, 0, &format!("proof:{day}"), now)
            .await
            .unwrap();
        assert!(progress.completed);
        assert_eq!(progress.day_index, day);

        let after = engine.get_enrollment_view(enrollment.id).await.unwrap();
        assert_step_invariants(&before, &after);
        assert_eq!(after.current_day, day + 1);
        before = after;
    }

    assert_eq!(before.status, EnrollmentStatus::Completed);
    assert_eq!(before.completed_days(), (0..7).collect::<Vec<_>>());
    assert!(before.closed_at.is_some());

    let events = engine.enrollment_events(enrollment.id).await.unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&EventKind::EnrollmentStarted));
    assert_eq!(kinds.last(), Some(&EventKind::EnrollmentCompleted));
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::DayCompleted).count(),
        7
    );
}

#[tokio::test]
async fn test_future_day_is_out_of_window_without_state_change() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("alice", "book", "medium", 500, t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 1, 0, "proof:x", t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::OutOfWindow {
            requested_day: 1,
            current_day: 0
        }
    ));
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), e);
}

#[tokio::test]
async fn test_past_day_cannot_be_backfilled() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("alice", "book", "medium", 500, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "proof:again", t0() + Duration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfWindow { .. }));
}

#[tokio::test]
async fn test_duplicate_unit_is_idempotent() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("bob", "water", "medium", 300, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(e.id, 0, 0, "glass:0", t0())
        .await
        .unwrap();
    let snapshot = engine.get_enrollment_view(e.id).await.unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "glass:other", t0() + Duration::minutes(30))
        .await
        .unwrap_err();
    match err {
        EngineError::DuplicateSubmission { existing, .. } => {
            assert_eq!(existing.proof_ref, "glass:0");
            assert_eq!(existing.submitted_at, t0());
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), snapshot);
}

#[tokio::test]
async fn test_water_glasses_are_paced() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("bob", "water", "medium", 300, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(e.id, 0, 0, "glass:0", t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 1, "glass:1", t0() + Duration::minutes(10))
        .await
        .unwrap_err();
    match err {
        EngineError::RateLimited {
            reason,
            retry_after,
        } => {
            assert_eq!(reason, DenyReason::MinimumInterval);
            assert_eq!(retry_after, Duration::minutes(10));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    let day = engine
        .submit_unit_proof(e.id, 0, 1, "glass:1", t0() + Duration::minutes(21))
        .await
        .unwrap();
    assert_eq!(day.filled_count(), 2);
    assert!(!day.completed);
}

#[tokio::test]
async fn test_hourly_cap_denies_without_state_change() {
    let catalog = Catalog::from_templates(vec![ChallengeTemplate {
        id: "stretch".into(),
        title: "Stretching".into(),
        sponsor: None,
        unit_label: "set".into(),
        pacing: Some(PacingRule {
            min_interval_minutes: 10,
            max_per_hour: 3,
        }),
        tiers: vec![DifficultyTier {
            id: "easy".into(),
            name: "EASY".into(),
            duration_days: 1,
            min_stake: 100,
            max_stake: 300,
            max_bonus: 15,
            platform_fee_percent: 5,
            units_per_day: 6,
            stake_step: 100,
            proof_required: String::new(),
            target: None,
        }],
    }])
    .unwrap();
    let engine = ChallengeEngine::new(Arc::new(catalog), Arc::new(MemoryStore::new()));
    let e = engine
        .start_enrollment("hana", "stretch", "easy", 100, t0())
        .await
        .unwrap();

    for (unit, minute) in [(0, 0), (1, 10), (2, 20)] {
        engine
            .submit_unit_proof(e.id, 0, unit, "set", t0() + Duration::minutes(minute))
            .await
            .unwrap();
    }
    let before = engine.get_enrollment_view(e.id).await.unwrap();
    let events_before = engine.enrollment_events(e.id).await.unwrap().len();

    // Past the minimum interval, but three sets already landed this hour.
    let err = engine
        .submit_unit_proof(e.id, 0, 3, "set", t0() + Duration::minutes(35))
        .await
        .unwrap_err();
    match err {
        EngineError::RateLimited {
            reason,
            retry_after,
        } => {
            assert_eq!(reason, DenyReason::HourlyCap);
            assert_eq!(retry_after, Duration::minutes(25));
        }
        other => panic!("expected hourly cap, got {other:?}"),
    }

    let after = engine.get_enrollment_view(e.id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.days[0].filled_count(), 3);
    assert_eq!(
        engine.enrollment_events(e.id).await.unwrap().len(),
        events_before
    );

    // Once the first set leaves the window the next one is admitted.
    let day = engine
        .submit_unit_proof(e.id, 0, 3, "set", t0() + Duration::minutes(61))
        .await
        .unwrap();
    assert_eq!(day.filled_count(), 4);
}

#[tokio::test]
async fn test_day_completes_when_all_fifteen_glasses_land_in_any_order() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("carol", "water", "easy", 200, t0())
        .await
        .unwrap();

    // A fixed permutation of 0..15.
    let order = [7u32, 3, 14, 0, 9, 1, 12, 5, 10, 2, 13, 6, 11, 4, 8];
    let mut before = e.clone();
    for (n, glass) in order.iter().enumerate() {
        let now = t0() + Duration::minutes(20 * n as i64);
        let day = engine
            .submit_unit_proof(e.id, 0, *glass, &format!("glass:{glass}"), now)
            .await
            .unwrap();
        assert_eq!(day.completed, n == order.len() - 1);

        let after = engine.get_enrollment_view(e.id).await.unwrap();
        assert_step_invariants(&before, &after);
        before = after;
    }

    // The easy tier lasts one day, so the last glass finishes the challenge.
    assert_eq!(before.current_day, 1);
    assert_eq!(before.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_unit_index_beyond_day_is_rejected() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("bob", "water", "medium", 300, t0())
        .await
        .unwrap();
    let err = engine
        .submit_unit_proof(e.id, 0, 15, "glass:15", t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnitOutOfRange {
            unit_index: 15,
            units_per_day: 15
        })
    ));
}

#[tokio::test]
async fn test_invalid_stake_creates_nothing() {
    let (engine, _) = setup();

    let err = engine
        .start_enrollment("dave", "book", "medium", 200, t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::StakeOutOfRange { .. })
    ));

    let err = engine
        .start_enrollment("dave", "book", "medium", 550, t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::StakeOffStep { .. })
    ));

    let err = engine
        .start_enrollment("dave", "yoga", "medium", 500, t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownTemplate(_))
    ));

    let err = engine
        .start_enrollment("", "book", "medium", 500, t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::MissingUser)
    ));

    assert!(engine.list_enrollments("dave").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_one_active_enrollment_per_template() {
    let (engine, _) = setup();
    let first = engine
        .start_enrollment("erin", "book", "easy", 100, t0())
        .await
        .unwrap();

    let err = engine
        .start_enrollment("erin", "book", "medium", 500, t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AlreadyEnrolled {
            existing_id: Some(id)
        } if id == first.id
    ));

    // Other templates and other users are unaffected.
    engine
        .start_enrollment("erin", "running", "easy", 150, t0())
        .await
        .unwrap();
    engine
        .start_enrollment("frank", "book", "easy", 100, t0())
        .await
        .unwrap();

    // Once the first one completes, the template is open again.
    engine
        .submit_unit_proof(first.id, 0, 0, "page", t0())
        .await
        .unwrap();
    engine
        .start_enrollment("erin", "book", "medium", 500, t0() + Duration::days(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_completed_enrollment_accepts_nothing() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("erin", "book", "easy", 100, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(e.id, 0, 0, "page", t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 1, 0, "page", t0())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotActive {
            status: EnrollmentStatus::Completed
        }
    ));
}

/// Fails anything once its nominal duration has elapsed, terminal or not.
struct AfterDuration;

impl FailurePolicy for AfterDuration {
    fn is_overdue(&self, enrollment: &Enrollment, now: DateTime<Utc>) -> bool {
        now > enrollment.started_at + Duration::days(i64::from(enrollment.duration_days()))
    }

    fn name(&self) -> &'static str {
        "after_duration"
    }
}

#[tokio::test]
async fn test_completed_enrollment_is_never_failed_by_policy() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_failure_policy(Arc::new(AfterDuration));
    let e = engine
        .start_enrollment("ivy", "book", "easy", 200, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(e.id, 0, 0, "page", t0())
        .await
        .unwrap();
    let done = engine.get_enrollment_view(e.id).await.unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    let events = engine.enrollment_events(e.id).await.unwrap().len();

    let later = t0() + Duration::days(5);
    assert_eq!(engine.expire_if_overdue(e.id, later).await.unwrap(), None);
    assert!(engine.sweep_overdue(later).await.unwrap().is_empty());

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        engine.submit_unit_proof(e.id, 1, 0, "page", t0() + Duration::days(30)),
    )
    .await
    .expect("submission must terminate")
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotActive {
            status: EnrollmentStatus::Completed
        }
    ));

    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), done);
    assert_eq!(engine.enrollment_events(e.id).await.unwrap().len(), events);
}

#[tokio::test]
async fn test_rejected_proof_leaves_slot_empty() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_verifier(Arc::new(RejectAll));
    let e = engine
        .start_enrollment("gina", "book", "medium", 500, t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProofRejected { ref reason } if reason == "blurry photo"));
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap(), e);
}

#[tokio::test]
async fn test_unreachable_verifier_is_reported_without_writing() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_verifier(Arc::new(Offline));
    let e = engine
        .start_enrollment("gina", "book", "medium", 500, t0())
        .await
        .unwrap();

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Verification(_)));
    assert_eq!(engine.get_enrollment_view(e.id).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_daily_deadline_fails_overdue_enrollment_on_submit() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_failure_policy(Arc::new(DailyDeadline::new(Duration::zero())));
    let e = engine
        .start_enrollment("hank", "book", "medium", 500, t0())
        .await
        .unwrap();

    // Day 0 done in time, day 1 missed.
    engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0() + Duration::hours(3))
        .await
        .unwrap();
    let late = t0() + Duration::days(2) + Duration::minutes(1);
    let err = engine
        .submit_unit_proof(e.id, 1, 0, "proof:1", late)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotActive {
            status: EnrollmentStatus::Failed
        }
    ));

    let view = engine.get_enrollment_view(e.id).await.unwrap();
    assert_eq!(view.status, EnrollmentStatus::Failed);
    assert_eq!(view.closed_at, Some(late));
    assert_all_enrollment_invariants(&view);

    let events = engine.enrollment_events(e.id).await.unwrap();
    let failed = events.last().unwrap();
    assert_eq!(failed.kind, EventKind::EnrollmentFailed);
    assert_eq!(failed.day_index, Some(1));
    assert_eq!(failed.amount, Some(500));
}

#[tokio::test]
async fn test_sweep_closes_only_overdue_enrollments() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store)
        .with_failure_policy(Arc::new(DailyDeadline::new(Duration::zero())));

    let stale = engine
        .start_enrollment("ivan", "book", "medium", 500, t0())
        .await
        .unwrap();
    let fresh = engine
        .start_enrollment("judy", "book", "medium", 500, t0() + Duration::hours(20))
        .await
        .unwrap();

    let closed = engine
        .sweep_overdue(t0() + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(closed, vec![stale.id]);
    assert_eq!(
        engine.get_enrollment_view(fresh.id).await.unwrap().status,
        EnrollmentStatus::Active
    );

    // A second sweep at the same instant has nothing left to do.
    assert!(engine
        .sweep_overdue(t0() + Duration::hours(25))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_never_fail_policy_keeps_late_enrollments_open() {
    let (engine, _) = setup();
    let e = engine
        .start_enrollment("kim", "book", "medium", 500, t0())
        .await
        .unwrap();
    let day = engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0() + Duration::days(30))
        .await
        .unwrap();
    assert!(day.completed);
    assert!(engine
        .sweep_overdue(t0() + Duration::days(60))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_user_summary_counts_statuses_and_escrow() {
    let (engine, _) = setup();
    let done = engine
        .start_enrollment("lena", "book", "easy", 200, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(done.id, 0, 0, "page", t0())
        .await
        .unwrap();
    let water = engine
        .start_enrollment("lena", "water", "medium", 700, t0())
        .await
        .unwrap();
    engine
        .submit_unit_proof(water.id, 0, 0, "glass", t0())
        .await
        .unwrap();
    engine
        .start_enrollment("lena", "earlysleep", "easy", 500, t0())
        .await
        .unwrap();

    let summary = engine.user_summary("lena").await.unwrap();
    assert_eq!(summary.active, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.escrowed, 1200);
    assert_eq!(summary.completed_days, 1);

    assert_eq!(engine.user_summary("nobody").await.unwrap().active, 0);
}

#[tokio::test]
async fn test_enrollment_unknown_to_catalog_is_a_config_error() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::new(Catalog::builtin()), store.clone());
    let e = engine
        .start_enrollment("mo", "book", "medium", 500, t0())
        .await
        .unwrap();

    let shrunk = Catalog::from_templates(vec![ChallengeTemplate {
        id: "book".into(),
        title: "Reading".into(),
        sponsor: None,
        unit_label: "photo".into(),
        pacing: None,
        tiers: vec![DifficultyTier {
            id: "easy".into(),
            name: "EASY".into(),
            duration_days: 1,
            min_stake: 100,
            max_stake: 300,
            max_bonus: 15,
            platform_fee_percent: 5,
            units_per_day: 1,
            stake_step: 100,
            proof_required: String::new(),
            target: None,
        }],
    }])
    .unwrap();
    let engine = ChallengeEngine::new(Arc::new(shrunk), store);

    let err = engine
        .submit_unit_proof(e.id, 0, 0, "proof:0", t0())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn test_missing_enrollment_is_not_found() {
    let (engine, _) = setup();
    assert!(matches!(
        engine.get_enrollment_view(42).await,
        Err(EngineError::NotFound(42))
    ));
    assert!(matches!(
        engine.submit_unit_proof(42, 0, 0, "p", t0()).await,
        Err(EngineError::NotFound(42))
    ));
    assert!(matches!(
        engine.enrollment_events(42).await,
        Err(EngineError::NotFound(42))
    ));
}
