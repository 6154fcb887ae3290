//! Reentrant transactions over a single backend connection.
//!
//! Nested units of work collapse into the outermost physical transaction:
//! only depth 0 issues BEGIN and COMMIT/ROLLBACK. A failure at any depth
//! marks the transaction rollback-only.

use crate::backend::DatabaseBackend;
use crate::error::{RepositoryError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    InTransaction,
    Committed,
    RolledBack,
}

/// Depth counter and rollback-only flag for one connection.
#[derive(Debug, Default)]
pub struct TransactionManager {
    depth: usize,
    rollback_only: bool,
    state: TransactionState,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of open units of work.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Open a unit of work; begins the physical transaction at depth 0.
    pub async fn enter<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: DatabaseBackend + ?Sized,
    {
        if self.depth == 0 {
            backend.begin_transaction().await?;
            self.rollback_only = false;
            self.state = TransactionState::InTransaction;
            debug!("transaction started");
        }
        self.depth += 1;
        Ok(())
    }

    /// Close a unit of work. The outermost exit commits, or rolls back if
    /// any unit of work failed.
    pub async fn exit<B>(&mut self, backend: &mut B, succeeded: bool) -> Result<()>
    where
        B: DatabaseBackend + ?Sized,
    {
        if self.depth == 0 {
            return Err(RepositoryError::Transaction(
                "no unit of work is open".to_string(),
            ));
        }

        if !succeeded {
            self.rollback_only = true;
        }

        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        if self.rollback_only {
            self.rollback_only = false;
            self.state = TransactionState::RolledBack;
            debug!("rolling back transaction");
            return backend.rollback().await;
        }

        match backend.commit().await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::RolledBack;
                if let Err(rollback_err) = backend.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                Err(err)
            }
        }
    }
}

/// Something that owns a backend and the transaction state for it.
pub trait TransactionScope: Send {
    type Backend: DatabaseBackend;

    fn transaction_parts(&mut self) -> (&mut TransactionManager, &mut Self::Backend);
}

/// Run `work` as one unit of work on `scope`.
///
/// Calls nest: an inner call joins the transaction of the outer one. If
/// any inner unit fails, the outermost call rolls back everything since
/// it began, and returns [`RepositoryError::Transaction`] if the failure
/// was swallowed on the way out. A panic in `work` rolls back before the
/// panic resumes.
///
/// ```no_run
/// # use aggregate_store::backend::DatabaseBackend;
/// # use aggregate_store::transaction::{run_in_transaction, Session};
/// # use aggregate_store::sqlite::SqliteBackend;
/// # async fn demo() -> aggregate_store::Result<()> {
/// let mut session = Session::new(SqliteBackend::memory().await?);
/// run_in_transaction(&mut session, |s| {
///     Box::pin(async move {
///         s.backend_mut().execute("CREATE TABLE t (x INTEGER)", &[]).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_in_transaction<S, T, F>(scope: &mut S, work: F) -> Result<T>
where
    S: TransactionScope,
    T: Send,
    F: for<'c> FnOnce(&'c mut S) -> BoxFuture<'c, Result<T>> + Send,
{
    {
        let (tx, backend) = scope.transaction_parts();
        tx.enter(backend).await?;
    }

    let outcome = AssertUnwindSafe(work(scope)).catch_unwind().await;

    let (tx, backend) = scope.transaction_parts();
    match outcome {
        Ok(Ok(value)) => {
            let swallowed = tx.depth() == 1 && tx.is_rollback_only();
            tx.exit(backend, true).await?;
            if swallowed {
                return Err(RepositoryError::Transaction(
                    "a nested unit of work failed; the transaction was rolled back".to_string(),
                ));
            }
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(rollback_err) = tx.exit(backend, false).await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
        Err(panic) => {
            if let Err(rollback_err) = tx.exit(backend, false).await {
                warn!(error = %rollback_err, "rollback after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// A bare backend with transaction state, for raw statements.
pub struct Session<B: DatabaseBackend> {
    backend: B,
    transactions: TransactionManager,
}

impl<B: DatabaseBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            transactions: TransactionManager::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn into_inner(self) -> B {
        self.backend
    }
}

impl<B: DatabaseBackend> TransactionScope for Session<B> {
    type Backend = B;

    fn transaction_parts(&mut self) -> (&mut TransactionManager, &mut B) {
        (&mut self.transactions, &mut self.backend)
    }
}
