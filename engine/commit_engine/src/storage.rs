//! # Storage
//!
//! The engine persists enrollments through the [`EnrollmentStore`] trait and
//! never reaches for a global handle.
//!
//! ## Contract
//!
//! | Operation     | Guarantee                                                     |
//! |---------------|---------------------------------------------------------------|
//! | `next_id`     | Monotonic, never reused                                       |
//! | `create`      | Enrollment + events written together, or nothing              |
//! | `create`      | Fails with `ActiveExists` if `(user, template)` is active     |
//! | `update`      | Applied only if stored `version == expected_version`          |
//! | `update`      | Enrollment + events written together, or nothing              |
//!
//! Callers set `enrollment.version = expected_version + 1` before `update`.
//!
//! ## Memory store
//!
//! [`MemoryStore`] keeps everything behind one `tokio` mutex. Each operation
//! takes the lock once and performs no other await while holding it, so a
//! dropped future can never leave a partial write behind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::StoreError;
use crate::events::EngineEvent;
use crate::types::{Enrollment, EnrollmentId, EnrollmentStatus};

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Allocate the id for the next enrollment.
    async fn next_id(&self) -> Result<EnrollmentId, StoreError>;

    async fn create(&self, enrollment: &Enrollment, events: &[EngineEvent])
        -> Result<(), StoreError>;

    async fn get(&self, id: EnrollmentId) -> Result<Option<Enrollment>, StoreError>;

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<Enrollment>, StoreError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Enrollment>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Enrollment>, StoreError>;

    /// Compare-and-swap write keyed on `expected_version`.
    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: u64,
        events: &[EngineEvent],
    ) -> Result<(), StoreError>;

    /// Events for one enrollment, oldest first.
    async fn events_for(&self, id: EnrollmentId) -> Result<Vec<EngineEvent>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    next_id: EnrollmentId,
    enrollments: BTreeMap<EnrollmentId, Enrollment>,
    events: Vec<EngineEvent>,
}

/// In-process store for tests and single-node embedding.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn next_id(&self) -> Result<EnrollmentId, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }

    async fn create(
        &self,
        enrollment: &Enrollment,
        events: &[EngineEvent],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let clash = state.enrollments.values().any(|e| {
            e.status == EnrollmentStatus::Active
                && e.user_id == enrollment.user_id
                && e.template_id == enrollment.template_id
        });
        if clash && enrollment.status == EnrollmentStatus::Active {
            return Err(StoreError::ActiveExists {
                user_id: enrollment.user_id.clone(),
                template_id: enrollment.template_id.clone(),
            });
        }
        if state.enrollments.contains_key(&enrollment.id) {
            return Err(StoreError::Backend(format!(
                "enrollment {} already exists",
                enrollment.id
            )));
        }
        state.enrollments.insert(enrollment.id, enrollment.clone());
        state.events.extend_from_slice(events);
        Ok(())
    }

    async fn get(&self, id: EnrollmentId) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.state.lock().await.enrollments.get(&id).cloned())
    }

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<Enrollment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .enrollments
            .values()
            .find(|e| {
                e.status == EnrollmentStatus::Active
                    && e.user_id == user_id
                    && e.template_id == template_id
            })
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .enrollments
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .enrollments
            .values()
            .filter(|e| e.status == EnrollmentStatus::Active)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: u64,
        events: &[EngineEvent],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or(StoreError::NotFound(enrollment.id))?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                id: enrollment.id,
                expected: expected_version,
            });
        }
        *stored = enrollment.clone();
        state.events.extend_from_slice(events);
        Ok(())
    }

    async fn events_for(&self, id: EnrollmentId) -> Result<Vec<EngineEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.enrollment_id == id)
            .cloned()
            .collect())
    }
}
