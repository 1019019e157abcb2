use crate::{
    db::DbPool,
    entities::scheduler_lease::{self, Entity as LeaseEntity},
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{
    sea_query::Condition, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, SqlErr,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Database-backed lease that lets one instance at a time run a given job.
///
/// A lease is a row in `scheduler_leases` keyed by job name. An instance may take it when no row
/// exists, when the row has lapsed, or when it already holds it.
#[derive(Clone)]
pub struct DbJobLease {
    db_pool: Arc<DbPool>,
    holder: String,
}

impl DbJobLease {
    pub fn new(db_pool: Arc<DbPool>, holder: impl Into<String>) -> Self {
        Self {
            db_pool,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Takes the lease on `job` for `ttl`. Returns false when another holder owns a live lease.
    pub async fn try_acquire(&self, job: &str, ttl: Duration) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ServiceError::InternalError(format!("Invalid lease ttl: {}", e)))?;
        let db = &*self.db_pool;

        let existing = LeaseEntity::find_by_id(job.to_string()).one(db).await?;
        if existing.is_none() {
            let inserted = scheduler_lease::ActiveModel {
                job_name: Set(job.to_string()),
                holder: Set(self.holder.clone()),
                lease_until: Set(until),
                updated_at: Set(now),
            }
            .insert(db)
            .await;
            return match inserted {
                Ok(_) => Ok(true),
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    debug!(job, "Lease row created concurrently by another instance");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            };
        }

        let taken = LeaseEntity::update_many()
            .set(scheduler_lease::ActiveModel {
                holder: Set(self.holder.clone()),
                lease_until: Set(until),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(scheduler_lease::Column::JobName.eq(job))
            .filter(
                Condition::any()
                    .add(scheduler_lease::Column::LeaseUntil.lt(now))
                    .add(scheduler_lease::Column::Holder.eq(self.holder.as_str())),
            )
            .exec(db)
            .await?;
        Ok(taken.rows_affected == 1)
    }

    /// Gives the lease up early if this instance holds it.
    pub async fn release(&self, job: &str) -> Result<(), ServiceError> {
        LeaseEntity::delete_many()
            .filter(scheduler_lease::Column::JobName.eq(job))
            .filter(scheduler_lease::Column::Holder.eq(self.holder.as_str()))
            .exec(&*self.db_pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_db;

    #[tokio::test]
    async fn second_holder_is_refused_until_expiry() {
        let db = Arc::new(memory_db().await);
        let a = DbJobLease::new(db.clone(), "instance-a");
        let b = DbJobLease::new(db.clone(), "instance-b");

        assert!(a.try_acquire("sweep", Duration::from_secs(600)).await.unwrap());
        assert!(!b.try_acquire("sweep", Duration::from_secs(600)).await.unwrap());
        // Re-entrant for the current holder.
        assert!(a.try_acquire("sweep", Duration::from_secs(600)).await.unwrap());

        a.release("sweep").await.unwrap();
        assert!(b.try_acquire("sweep", Duration::from_secs(600)).await.unwrap());
    }

    #[tokio::test]
    async fn lapsed_lease_can_be_taken_over() {
        let db = Arc::new(memory_db().await);
        let a = DbJobLease::new(db.clone(), "instance-a");
        let b = DbJobLease::new(db.clone(), "instance-b");

        assert!(a.try_acquire("sweep", Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.try_acquire("sweep", Duration::from_secs(600)).await.unwrap());
    }
}
