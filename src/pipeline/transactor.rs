//! Scoped transactions over the analytical store
//!
//! `TxBeginner` checks out a pooled connection on a blocking thread, begins a
//! transaction, and hands the callback a `TxScope`. Repository reads given that scope run on
//! the transaction; reads given `None` use a connection of their own. The
//! transaction commits when the callback returns `Ok` and rolls back
//! otherwise, with any rollback failure folded into the returned error.
//!
//! Cancelling the caller's `QueryContext` interrupts the running statement,
//! forces a rollback, and surfaces `StoreError::Cancelled`.

use super::db::{ConnectionPool, PooledConnection, StoreError};
use async_trait::async_trait;
use rusqlite::{Connection, Transaction};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Per-request context carried into coordinated reads
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
}

impl QueryContext {
    /// Context that is never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { cancel: token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Active transaction handed to a coordinator callback
pub struct TxScope<'a> {
    tx: &'a Transaction<'a>,
}

impl<'a> TxScope<'a> {
    fn new(tx: &'a Transaction<'a>) -> Self {
        Self { tx }
    }

    /// Connection view of the active transaction
    pub fn connection(&self) -> &Connection {
        self.tx
    }
}

/// Runs callbacks inside store transactions
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Run `f` in a transaction, discarding its value
    async fn with_transaction<F>(&self, ctx: &QueryContext, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&TxScope<'_>) -> Result<(), StoreError> + Send + 'static,
    {
        self.with_transaction_value(ctx, f).await
    }

    /// Run `f` in a transaction and return what it produced
    async fn with_transaction_value<T, F>(&self, ctx: &QueryContext, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&TxScope<'_>) -> Result<T, StoreError> + Send + 'static;
}

/// Pool-backed `Transactor`
pub struct TxBeginner {
    pool: Arc<ConnectionPool>,
}

impl TxBeginner {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transactor for TxBeginner {
    async fn with_transaction_value<T, F>(&self, ctx: &QueryContext, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&TxScope<'_>) -> Result<T, StoreError> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let pool = Arc::clone(&self.pool);
        let cancel = ctx.token().clone();
        let task_cancel = cancel.clone();
        let (interrupt_tx, interrupt_rx) = oneshot::channel();

        // The connection comes back with the outcome so it stays checked out
        // until any interrupt aimed at it has been delivered
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let _ = interrupt_tx.send(conn.get_interrupt_handle());
            let outcome = run_in_transaction(&mut conn, &task_cancel, f);
            Ok::<_, StoreError>((conn, outcome))
        });

        tokio::select! {
            joined = &mut handle => settle(joined),
            _ = cancel.cancelled() => {
                if let Ok(interrupt) = interrupt_rx.await {
                    interrupt.interrupt();
                }
                let outcome = settle(handle.await);
                log::debug!("Coordinated read cancelled");
                Err(as_cancelled(outcome))
            }
        }
    }
}

type Joined<T> = Result<Result<(PooledConnection, Result<T, StoreError>), StoreError>, JoinError>;

/// Unwrap a finished transaction task and return its connection to the pool
fn settle<T>(joined: Joined<T>) -> Result<T, StoreError> {
    let (conn, outcome) = joined.map_err(|e| StoreError::Task(e.to_string()))??;
    drop(conn);
    outcome
}

fn run_in_transaction<T, F>(conn: &mut Connection, cancel: &CancellationToken, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&TxScope<'_>) -> Result<T, StoreError>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }

    let tx = conn.transaction().map_err(StoreError::Begin)?;

    let outcome = f(&TxScope::new(&tx)).and_then(|value| {
        if cancel.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(value)
        }
    });

    match outcome {
        Ok(value) => {
            tx.commit().map_err(StoreError::Commit)?;
            Ok(value)
        }
        Err(cause) => match tx.rollback() {
            Ok(()) => Err(cause),
            Err(rollback) => Err(StoreError::RolledBack {
                cause: Box::new(cause),
                rollback,
            }),
        },
    }
}

/// Replace whatever the interrupted callback returned with `Cancelled`,
/// keeping a rollback failure if there was one
fn as_cancelled<T>(outcome: Result<T, StoreError>) -> StoreError {
    match outcome {
        Err(StoreError::RolledBack { rollback, .. }) => StoreError::RolledBack {
            cause: Box::new(StoreError::Cancelled),
            rollback,
        },
        _ => StoreError::Cancelled,
    }
}
