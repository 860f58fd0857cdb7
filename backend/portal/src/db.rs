//! Database layer: migrations, the SQLite enrollment store, proof blobs.
//!
//! Enrollment rows keep the per-day progress as a JSON column and carry a
//! `version` used for compare-and-swap updates. Every write goes through one
//! transaction together with its audit events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use commit_engine::{
    DayProgress, EngineEvent, Enrollment, EnrollmentId, EnrollmentStatus, EnrollmentStore,
    EventKind, StoreError,
};

use crate::errors::Result;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Create the file on first start.
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct EnrollmentRow {
    id: i64,
    user_id: String,
    template_id: String,
    tier_id: String,
    stake_amount: i64,
    started_at: String,
    closed_at: Option<String>,
    status: String,
    current_day: i64,
    days_json: String,
    version: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    enrollment_id: i64,
    kind: String,
    user_id: String,
    day_index: Option<i64>,
    unit_index: Option<i64>,
    amount: Option<i64>,
    at: String,
}

const ENROLLMENT_COLUMNS: &str = "id, user_id, template_id, tier_id, stake_amount, started_at, \
     closed_at, status, current_day, days_json, version";

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {s:?}: {e}")))
}

fn to_u32(v: i64, column: &str) -> std::result::Result<u32, StoreError> {
    u32::try_from(v).map_err(|_| StoreError::Backend(format!("{column} out of range: {v}")))
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> std::result::Result<Self, StoreError> {
        let days: Vec<DayProgress> = serde_json::from_str(&row.days_json).map_err(backend)?;
        Ok(Enrollment {
            id: row.id as EnrollmentId,
            user_id: row.user_id,
            template_id: row.template_id,
            tier_id: row.tier_id,
            stake_amount: row.stake_amount,
            started_at: parse_time(&row.started_at)?,
            closed_at: row.closed_at.as_deref().map(parse_time).transpose()?,
            status: EnrollmentStatus::parse(&row.status)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {:?}", row.status)))?,
            current_day: to_u32(row.current_day, "current_day")?,
            days,
            version: row.version as u64,
        })
    }
}

impl TryFrom<EventRow> for EngineEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> std::result::Result<Self, StoreError> {
        Ok(EngineEvent {
            kind: EventKind::parse(&row.kind)
                .ok_or_else(|| StoreError::Backend(format!("unknown event kind {:?}", row.kind)))?,
            enrollment_id: row.enrollment_id as EnrollmentId,
            user_id: row.user_id,
            day_index: row.day_index.map(|d| to_u32(d, "day_index")).transpose()?,
            unit_index: row.unit_index.map(|u| to_u32(u, "unit_index")).transpose()?,
            amount: row.amount,
            at: parse_time(&row.at)?,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Enrollment store
// ─────────────────────────────────────────────────────────

/// [`EnrollmentStore`] over a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_many(
        &self,
        filter: &str,
        bind: Option<&str>,
    ) -> std::result::Result<Vec<Enrollment>, StoreError> {
        let sql = format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE {filter} ORDER BY id ASC");
        let mut query = sqlx::query_as::<_, EnrollmentRow>(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.into_iter().map(Enrollment::try_from).collect()
    }
}

async fn insert_events(
    tx: &mut Transaction<'_, Sqlite>,
    events: &[EngineEvent],
) -> std::result::Result<(), StoreError> {
    for ev in events {
        sqlx::query(
            r#"
            INSERT INTO events
                (enrollment_id, kind, user_id, day_index, unit_index, amount, at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(ev.enrollment_id as i64)
        .bind(ev.kind.as_str())
        .bind(&ev.user_id)
        .bind(ev.day_index.map(i64::from))
        .bind(ev.unit_index.map(i64::from))
        .bind(ev.amount)
        .bind(ev.at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    }
    Ok(())
}

#[async_trait]
impl EnrollmentStore for SqliteStore {
    async fn next_id(&self) -> std::result::Result<EnrollmentId, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "UPDATE enrollment_counter SET next_id = next_id + 1 WHERE id = 1 RETURNING next_id - 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(id as EnrollmentId)
    }

    async fn create(
        &self,
        enrollment: &Enrollment,
        events: &[EngineEvent],
    ) -> std::result::Result<(), StoreError> {
        let days_json = serde_json::to_string(&enrollment.days).map_err(backend)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO enrollments
                (id, user_id, template_id, tier_id, stake_amount, started_at,
                 closed_at, status, current_day, days_json, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(enrollment.id as i64)
        .bind(&enrollment.user_id)
        .bind(&enrollment.template_id)
        .bind(&enrollment.tier_id)
        .bind(enrollment.stake_amount)
        .bind(enrollment.started_at.to_rfc3339())
        .bind(enrollment.closed_at.map(|t| t.to_rfc3339()))
        .bind(enrollment.status.as_str())
        .bind(i64::from(enrollment.current_day))
        .bind(&days_json)
        .bind(enrollment.version as i64)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && db.message().contains("user_id") =>
            {
                return Err(StoreError::ActiveExists {
                    user_id: enrollment.user_id.clone(),
                    template_id: enrollment.template_id.clone(),
                });
            }
            Err(e) => return Err(backend(e)),
        }

        insert_events(&mut tx, events).await?;
        tx.commit().await.map_err(backend)?;
        debug!("Stored enrollment {}", enrollment.id);
        Ok(())
    }

    async fn get(&self, id: EnrollmentId) -> std::result::Result<Option<Enrollment>, StoreError> {
        let sql = format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?1");
        let row = sqlx::query_as::<_, EnrollmentRow>(&sql)
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Enrollment::try_from).transpose()
    }

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> std::result::Result<Option<Enrollment>, StoreError> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments \
             WHERE user_id = ?1 AND template_id = ?2 AND status = 'active'"
        );
        let row = sqlx::query_as::<_, EnrollmentRow>(&sql)
            .bind(user_id)
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Enrollment::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> std::result::Result<Vec<Enrollment>, StoreError> {
        self.fetch_many("user_id = ?1", Some(user_id)).await
    }

    async fn list_active(&self) -> std::result::Result<Vec<Enrollment>, StoreError> {
        self.fetch_many("status = 'active'", None).await
    }

    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: u64,
        events: &[EngineEvent],
    ) -> std::result::Result<(), StoreError> {
        let days_json = serde_json::to_string(&enrollment.days).map_err(backend)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let affected = sqlx::query(
            r#"
            UPDATE enrollments
            SET    status = ?1, current_day = ?2, days_json = ?3, closed_at = ?4, version = ?5
            WHERE  id = ?6 AND version = ?7
            "#,
        )
        .bind(enrollment.status.as_str())
        .bind(i64::from(enrollment.current_day))
        .bind(&days_json)
        .bind(enrollment.closed_at.map(|t| t.to_rfc3339()))
        .bind(enrollment.version as i64)
        .bind(enrollment.id as i64)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(backend)?
        .rows_affected();

        if affected == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM enrollments WHERE id = ?1")
                .bind(enrollment.id as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            return Err(match exists {
                Some(_) => StoreError::Conflict {
                    id: enrollment.id,
                    expected: expected_version,
                },
                None => StoreError::NotFound(enrollment.id),
            });
        }

        insert_events(&mut tx, events).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn events_for(&self, id: EnrollmentId) -> std::result::Result<Vec<EngineEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT enrollment_id, kind, user_id, day_index, unit_index, amount, at
            FROM   events
            WHERE  enrollment_id = ?1
            ORDER  BY id ASC
            "#,
        )
        .bind(id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(EngineEvent::try_from).collect()
    }
}

// ─────────────────────────────────────────────────────────
// Proof blobs
// ─────────────────────────────────────────────────────────

/// Persist an uploaded proof image and return its row id.
pub async fn insert_proof(
    pool: &SqlitePool,
    user_id: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO proofs (user_id, content_type, bytes) VALUES (?1, ?2, ?3) RETURNING id",
    )
    .bind(user_id)
    .bind(content_type)
    .bind(bytes)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Content type and owner of a stored proof, if it exists.
pub async fn proof_meta(pool: &SqlitePool, id: i64) -> Result<Option<(String, String)>> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT user_id, content_type FROM proofs WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // One connection: every `:memory:` connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
