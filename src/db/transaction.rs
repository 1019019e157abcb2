/*!
 * Unit of work
 *
 * A unit of work either owns a physical transaction or joins one that a caller further up the
 * chain already opened. Which of the two happens is decided purely by the context value handed
 * in, so a service method can be called on its own or from inside another service's transaction
 * without opening a second one.
 */

use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

enum Txn<'a> {
    Owned(DatabaseTransaction),
    Joined(&'a DatabaseTransaction),
}

/// Atomic transaction boundary spanning writes to several entity types.
pub struct UnitOfWork<'a> {
    txn: Txn<'a>,
    id: Uuid,
    started: Instant,
}

impl<'a> UnitOfWork<'a> {
    /// Opens a transaction on `db` when `outer` is `None`, otherwise joins `outer`.
    pub async fn begin(
        db: &DatabaseConnection,
        outer: Option<&'a DatabaseTransaction>,
    ) -> Result<UnitOfWork<'a>, DbErr> {
        match outer {
            Some(txn) => Ok(Self::join(txn)),
            None => {
                let txn = db.begin().await?;
                let id = Uuid::new_v4();
                debug!(transaction_id = %id, "Started database transaction");
                counter!("stateset_db.transaction.started", 1);
                Ok(Self {
                    txn: Txn::Owned(txn),
                    id,
                    started: Instant::now(),
                })
            }
        }
    }

    /// Joins an already open transaction. Committing a joined unit is a no-op.
    pub fn join(txn: &'a DatabaseTransaction) -> Self {
        Self {
            txn: Txn::Joined(txn),
            id: Uuid::nil(),
            started: Instant::now(),
        }
    }

    /// True when this unit opened the physical transaction and is responsible for committing it.
    pub fn is_owner(&self) -> bool {
        matches!(self.txn, Txn::Owned(_))
    }

    /// Connection every read and write of this unit must go through.
    pub fn conn(&self) -> &DatabaseTransaction {
        match &self.txn {
            Txn::Owned(txn) => txn,
            Txn::Joined(txn) => txn,
        }
    }

    /// Commits the transaction if this unit owns it. Joined units leave the decision to the owner.
    pub async fn commit(self) -> Result<(), DbErr> {
        match self.txn {
            Txn::Owned(txn) => {
                let result = txn.commit().await;
                histogram!("stateset_db.transaction.duration", self.started.elapsed());
                match &result {
                    Ok(()) => {
                        counter!("stateset_db.transaction.committed", 1);
                        debug!(transaction_id = %self.id, "Transaction committed");
                    }
                    Err(_) => {
                        counter!("stateset_db.transaction.rolled_back", 1);
                    }
                }
                result
            }
            Txn::Joined(_) => Ok(()),
        }
    }

    /// Rolls back an owned transaction. Dropping an uncommitted unit has the same effect.
    pub async fn rollback(self) -> Result<(), DbErr> {
        match self.txn {
            Txn::Owned(txn) => {
                counter!("stateset_db.transaction.rolled_back", 1);
                txn.rollback().await
            }
            Txn::Joined(_) => Ok(()),
        }
    }
}
