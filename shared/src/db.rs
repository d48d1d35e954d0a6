//! Postgres access: pool, migrations and the outbox store.

use async_trait::async_trait;
use chrono::Duration;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, OutboxError};
use crate::models::{DbOutboxEvent, NewDbOutboxEvent};
use crate::outbox::{
    retry_backoff, truncate_error, NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore,
    OutboxWriter,
};
use crate::schema::outbox_events;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub async fn connect(database_url: &str, max_size: u32) -> Result<DbPool, OutboxError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(config)
        .await
        .map_err(|e| OutboxError::Pool(e.to_string()))
}

pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");
    Ok(())
}

/// Maps a unique violation on `constraint` to a duplicate effect. Any other
/// database error, including violations of unrelated constraints, is a
/// plain failure.
pub fn classify_unique_violation(err: DieselError, constraint: &str) -> DomainError {
    let duplicate = matches!(
        &err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
            if info.constraint_name() == Some(constraint)
    );

    if duplicate {
        DomainError::DuplicateEffect(constraint.to_string())
    } else {
        DomainError::Failed(err.into())
    }
}

#[async_trait]
impl OutboxWriter for AsyncPgConnection {
    async fn enlist(&mut self, event: NewOutboxEvent) -> Result<(), OutboxError> {
        event.validate()?;

        diesel::insert_into(outbox_events::table)
            .values(NewDbOutboxEvent::from(event))
            .execute(self)
            .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    /// Plain read; assumes a single publisher instance.
    #[default]
    Shared,
    /// `FOR UPDATE SKIP LOCKED`, pushing `next_retry_at` out by `lease` so
    /// other publishers skip the claimed rows until the lease expires.
    SkipLocked { lease: std::time::Duration },
}

pub struct PgOutboxStore {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    claim_mode: ClaimMode,
    max_attempts: Option<i32>,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            claim_mode: ClaimMode::Shared,
            max_attempts: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_claim_mode(mut self, mode: ClaimMode) -> Self {
        self.claim_mode = mode;
        self
    }

    /// Rows that failed this many times are left parked for an operator.
    pub fn with_max_attempts(mut self, max_attempts: Option<i32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

const CLAIMABLE: [&str; 2] = ["pending", "failed"];

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let max_attempts = self.max_attempts.unwrap_or(i32::MAX);
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        let rows = match self.claim_mode {
            ClaimMode::Shared => {
                outbox_events::table
                    .filter(outbox_events::status.eq_any(CLAIMABLE))
                    .filter(
                        outbox_events::next_retry_at
                            .is_null()
                            .or(outbox_events::next_retry_at.le(now)),
                    )
                    .filter(outbox_events::retry_count.lt(max_attempts))
                    .order((outbox_events::created_at.asc(), outbox_events::seq.asc()))
                    .limit(limit)
                    .select(DbOutboxEvent::as_select())
                    .load::<DbOutboxEvent>(conn)
                    .await?
            }
            ClaimMode::SkipLocked { lease } => {
                let lease_until = now
                    + Duration::from_std(lease)
                        .map_err(|e| OutboxError::InvalidEvent(e.to_string()))?;

                conn.transaction::<_, OutboxError, _>(|conn| {
                    Box::pin(async move {
                        let mut rows = outbox_events::table
                            .filter(outbox_events::status.eq_any(CLAIMABLE))
                            .filter(
                                outbox_events::next_retry_at
                                    .is_null()
                                    .or(outbox_events::next_retry_at.le(now)),
                            )
                            .filter(outbox_events::retry_count.lt(max_attempts))
                            .order((outbox_events::created_at.asc(), outbox_events::seq.asc()))
                            .limit(limit)
                            .select(DbOutboxEvent::as_select())
                            .for_update()
                            .skip_locked()
                            .load::<DbOutboxEvent>(conn)
                            .await?;

                        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
                        diesel::update(outbox_events::table.filter(outbox_events::id.eq_any(ids)))
                            .set((
                                outbox_events::next_retry_at.eq(Some(lease_until)),
                                outbox_events::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;

                        for row in &mut rows {
                            row.next_retry_at = Some(lease_until);
                        }
                        Ok(rows)
                    })
                })
                .await?
            }
        };

        debug!(claimed = rows.len(), "Claimed outbox batch");
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, OutboxError, _>(|conn| {
            Box::pin(async move {
                let status: String = outbox_events::table
                    .find(id)
                    .select(outbox_events::status)
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(OutboxError::NotFound(id))?;

                if status == OutboxStatus::Sent.as_str() {
                    return Ok(());
                }

                diesel::update(outbox_events::table.find(id))
                    .set((
                        outbox_events::status.eq(OutboxStatus::Sent.as_str()),
                        outbox_events::processed_at.eq(Some(now)),
                        outbox_events::error_message.eq(None::<String>),
                        outbox_events::next_retry_at.eq(None::<chrono::DateTime<chrono::Utc>>),
                        outbox_events::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let reason = truncate_error(reason);
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, OutboxError, _>(|conn| {
            Box::pin(async move {
                let (status, retry_count): (String, i32) = outbox_events::table
                    .find(id)
                    .select((outbox_events::status, outbox_events::retry_count))
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(OutboxError::NotFound(id))?;

                if status == OutboxStatus::Sent.as_str() {
                    return Ok(());
                }

                let retry_count = retry_count.saturating_add(1);
                diesel::update(outbox_events::table.find(id))
                    .set((
                        outbox_events::status.eq(OutboxStatus::Failed.as_str()),
                        outbox_events::retry_count.eq(retry_count),
                        outbox_events::error_message.eq(Some(reason)),
                        outbox_events::next_retry_at.eq(Some(now + retry_backoff(retry_count))),
                        outbox_events::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let mut conn = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        outbox_events::table
            .find(id)
            .select(DbOutboxEvent::as_select())
            .first::<DbOutboxEvent>(conn)
            .await
            .optional()?
            .map(OutboxEvent::try_from)
            .transpose()
    }
}
