//! Implicit-transaction executor.
//!
//! [`Atomic::run`] takes an optional caller context. With a context that has
//! a transaction open, the work runs inside it and nothing is committed or
//! rolled back here. A context without an open transaction gets one for the
//! duration of the call. Without a context, a connection is leased, a
//! transaction opened, and the work committed on success or rolled back on
//! failure.
//!
//! What a failure turns into is chosen by the [`FailurePolicy`]: [`Raise`]
//! returns the error, [`Report`] returns it as a value.

use crate::db::DbAdapter;
use crate::db::connection::TxContext;
use crate::error::{DbError, DbResult, FailureReport};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// How an atomic scope hands back its result.
pub trait FailurePolicy: Send + Sync {
    type Output<T: Send>: Send;

    fn success<T: Send>(&self, value: T) -> Self::Output<T>;

    fn failure<T: Send>(&self, err: DbError) -> Self::Output<T>;
}

/// Propagate failures as `Err`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raise;

impl FailurePolicy for Raise {
    type Output<T: Send> = DbResult<T>;

    fn success<T: Send>(&self, value: T) -> DbResult<T> {
        Ok(value)
    }

    fn failure<T: Send>(&self, err: DbError) -> DbResult<T> {
        Err(err)
    }
}

pub type FailureHandler = Arc<dyn Fn(&DbError) -> FailureReport + Send + Sync>;

/// Convert failures into [`Outcome::Failed`].
#[derive(Clone)]
pub struct Report {
    handler: FailureHandler,
}

impl Report {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(|err: &DbError| FailureReport::from(err)),
        }
    }

    /// Use a custom conversion instead of [`FailureReport::from`].
    pub fn with_handler(handler: impl Fn(&DbError) -> FailureReport + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report").finish_non_exhaustive()
    }
}

impl FailurePolicy for Report {
    type Output<T: Send> = Outcome<T>;

    fn success<T: Send>(&self, value: T) -> Outcome<T> {
        Outcome::Value(value)
    }

    fn failure<T: Send>(&self, err: DbError) -> Outcome<T> {
        let report = (self.handler)(&err);
        debug!(kind = %report.kind, "Atomic scope failed, reporting");
        Outcome::Failed(report)
    }
}

/// Result of a reporting atomic scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Value(T),
    Failed(FailureReport),
}

impl<T> Outcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            Self::Value(_) => None,
            Self::Failed(report) => Some(report),
        }
    }
}

/// Atomic executor bound to an adapter.
#[derive(Debug, Clone)]
pub struct Atomic<P: FailurePolicy = Raise> {
    adapter: DbAdapter,
    policy: P,
}

impl<P: FailurePolicy> Atomic<P> {
    pub fn new(adapter: DbAdapter, policy: P) -> Self {
        Self { adapter, policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Run `work` atomically.
    ///
    /// With `Some(ctx)` the work joins the caller's transaction, or opens one
    /// on the caller's connection when none is active. With `None` this call
    /// leases a connection and owns the transaction.
    pub async fn run<T, F>(&self, ctx: Option<&mut TxContext>, work: F) -> P::Output<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let result = match ctx {
            Some(ctx) if ctx.in_transaction() => {
                debug!(transaction_id = %ctx.id(), "Joining caller transaction");
                work(ctx).await
            }
            Some(ctx) => {
                debug!(transaction_id = %ctx.id(), "Opening transaction on caller connection");
                in_transaction(ctx, work).await
            }
            None => self.run_owned(work).await,
        };
        match result {
            Ok(value) => self.policy.success(value),
            Err(err) => self.policy.failure(err),
        }
    }

    async fn run_owned<T, F>(&self, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut ctx = self.adapter.acquire().await?;
        let result = in_transaction(&mut ctx, work).await;
        release_logged(ctx).await;
        result
    }
}

/// Begin on `ctx`, run `work`, then commit or roll back. The connection stays
/// with the caller.
async fn in_transaction<T, F>(ctx: &mut TxContext, work: F) -> DbResult<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, DbResult<T>> + Send,
{
    ctx.begin().await?;
    match work(&mut *ctx).await {
        Ok(value) => ctx.commit().await.map(|_| value),
        Err(err) => {
            // The work may have finished the transaction itself.
            if ctx.in_transaction() {
                if let Err(rollback_err) = ctx.rollback().await {
                    warn!(
                        transaction_id = %ctx.id(),
                        error = %rollback_err,
                        "Rollback failed after error"
                    );
                }
            }
            Err(err)
        }
    }
}

/// Release a connection, logging instead of masking the scope's own result.
async fn release_logged(ctx: TxContext) {
    let id = ctx.id().to_string();
    if let Err(e) = ctx.release().await {
        warn!(transaction_id = %id, error = %e, "Failed to release connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_policy() {
        let ok: DbResult<i32> = Raise.success(1);
        assert_eq!(ok.unwrap(), 1);
        let err: DbResult<i32> = Raise.failure(DbError::missing_predicate("t"));
        assert!(matches!(err, Err(DbError::MissingPredicate { .. })));
    }

    #[test]
    fn test_report_policy_default_handler() {
        let report = Report::new();
        let out: Outcome<i32> = report.failure(DbError::database(
            "duplicate key",
            Some("23505".to_string()),
            "check data",
        ));
        let failure = out.failure().unwrap();
        assert_eq!(failure.kind, "database_error");
        assert_eq!(failure.sql_state.as_deref(), Some("23505"));
        assert!(out.is_failed());
        assert_eq!(out.value(), None);
    }

    #[test]
    fn test_report_policy_custom_handler() {
        let report = Report::with_handler(|err| FailureReport {
            kind: "custom".to_string(),
            message: err.kind().to_string(),
            sql_state: None,
        });
        let out: Outcome<()> = report.failure(DbError::internal("boom"));
        assert_eq!(out.failure().unwrap().message, "internal_error");
        assert_eq!(report.success(5).value(), Some(5));
    }
}
