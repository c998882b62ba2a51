//! Leased connection with transaction state.
//!
//! A [`TxContext`] owns one pooled connection for the duration of a call tree.
//! Statements passed an explicit context run on that connection, inside its
//! transaction if one is open.

use crate::db::params::{Bound, bind_all, coerce};
use crate::db::registry::{Lease, Pool, SetupHook};
use crate::db::types::{Row, RowToJson};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use crate::sql::Statement;
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnection, PgRow, PgTypeInfo};
use sqlx::{Either, Executor, Statement as _};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a leased connection's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Leased, setup not finished
    Acquiring,
    /// Ready, no transaction open
    Idle,
    InTransaction,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// True while a `BEGIN` is outstanding on the server.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::InTransaction | Self::Committing | Self::RollingBack
        )
    }

    /// A new transaction may start from here.
    pub fn can_begin(&self) -> bool {
        matches!(self, Self::Idle | Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Acquiring => "acquiring",
            Self::Idle => "idle",
            Self::InTransaction => "in_transaction",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// A leased connection plus its transaction state.
///
/// Dropping a context returns the connection to the pool. If a transaction is
/// still open at that point (the owning future was cancelled), the connection
/// is closed instead so the open transaction never reaches another caller.
pub struct TxContext {
    conn: Option<Lease>,
    pool: Pool,
    id: String,
    state: TransactionState,
    backend_pid: i32,
    statements: u64,
    command_timeout: Option<Duration>,
    /// Cursors abandoned mid-stream in the open transaction.
    stale_cursors: Vec<String>,
}

impl TxContext {
    pub(crate) fn acquiring(pool: Pool, conn: Lease) -> Self {
        let command_timeout = pool.settings().command_timeout();
        Self {
            conn: Some(conn),
            pool,
            id: generate_transaction_id(),
            state: TransactionState::Acquiring,
            backend_pid: 0,
            statements: 0,
            command_timeout,
            stale_cursors: Vec::new(),
        }
    }

    /// Look up the backend pid and run the setup hook.
    pub(crate) async fn prepare(&mut self, setup: Option<&SetupHook>) -> DbResult<()> {
        let conn = self.raw()?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        if let Some(hook) = setup {
            (**hook)(&mut *conn).await?;
        }
        self.backend_pid = pid;
        self.statements = self.pool.statements_for(pid);
        self.state = TransactionState::Idle;
        debug!(
            transaction_id = %self.id,
            backend_pid = pid,
            statements = self.statements,
            "Connection leased"
        );
        Ok(())
    }

    /// Identifier used in logs, `tx_<uuid>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state == TransactionState::InTransaction
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Statements this physical connection has run, across leases.
    pub fn statements(&self) -> u64 {
        self.statements
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn raw(&mut self) -> DbResult<&mut PgConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DbError::transaction("connection already released", &self.id)),
        }
    }

    /// Direct access to the connection for sqlx calls the adapter does not cover.
    pub fn connection(&mut self) -> DbResult<&mut PgConnection> {
        self.statements += 1;
        self.raw()
    }

    /// Open a transaction. Fails if one is already open.
    pub async fn begin(&mut self) -> DbResult<()> {
        if !self.state.can_begin() {
            return Err(DbError::transaction(
                format!("cannot begin while {}", self.state),
                &self.id,
            ));
        }
        self.simple("BEGIN").await?;
        self.state = TransactionState::InTransaction;
        debug!(transaction_id = %self.id, backend_pid = self.backend_pid, "Transaction started");
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.expect_open("commit")?;
        self.stale_cursors.clear();
        self.state = TransactionState::Committing;
        match self.simple("COMMIT").await {
            Ok(_) => {
                self.state = TransactionState::Committed;
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                // A failed COMMIT leaves the server side aborted; roll back so
                // the connection can be reused.
                warn!(transaction_id = %self.id, error = %e, "Commit failed, rolling back");
                self.state = TransactionState::InTransaction;
                let _ = self.rollback().await;
                Err(e)
            }
        }
    }

    /// Roll back the open transaction.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.expect_open("rollback")?;
        self.stale_cursors.clear();
        self.state = TransactionState::RollingBack;
        self.simple("ROLLBACK").await?;
        self.state = TransactionState::RolledBack;
        warn!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    fn expect_open(&self, action: &str) -> DbResult<()> {
        if self.state == TransactionState::InTransaction {
            Ok(())
        } else {
            Err(DbError::transaction(
                format!("cannot {action} while {}", self.state),
                &self.id,
            ))
        }
    }

    /// Return the connection to the pool, rolling back a transaction left open.
    ///
    /// Connections that reached `max_queries` are closed instead.
    pub async fn release(mut self) -> DbResult<()> {
        if self.in_transaction() {
            warn!(transaction_id = %self.id, "Releasing connection with open transaction");
            self.rollback().await?;
        }
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if self.pool.record_release(self.backend_pid, self.statements) {
            info!(
                backend_pid = self.backend_pid,
                statements = self.statements,
                max_queries = self.pool.max_queries(),
                "Connection reached max_queries, closing"
            );
            conn.close().await?;
        }
        Ok(())
    }

    pub(crate) fn defer_cursor_close(&mut self, cursor: String) {
        self.stale_cursors.push(cursor);
    }

    /// Close cursors abandoned by dropped streams. A transaction that already
    /// ended took them with it.
    async fn close_stale_cursors(&mut self) {
        if self.stale_cursors.is_empty() {
            return;
        }
        let cursors = std::mem::take(&mut self.stale_cursors);
        if !self.in_transaction() {
            return;
        }
        for cursor in cursors {
            self.statements += 1;
            let sql = format!("CLOSE {cursor}");
            let closed = match self.raw() {
                Ok(conn) => conn.execute(sql.as_str()).await.map_err(DbError::from),
                Err(e) => Err(e),
            };
            match closed {
                Ok(_) => debug!(transaction_id = %self.id, cursor = %cursor, "Closed abandoned cursor"),
                Err(e) => warn!(
                    transaction_id = %self.id,
                    cursor = %cursor,
                    error = %e,
                    "Failed to close abandoned cursor"
                ),
            }
        }
    }

    /// Run SQL over the simple query protocol. May hold several statements.
    pub async fn simple(&mut self, sql: &str) -> DbResult<u64> {
        self.close_stale_cursors().await;
        debug!(transaction_id = %self.id, sql = %sql, "Executing simple query");
        self.statements += 1;
        let timeout = self.command_timeout;
        let conn = self.raw()?;
        let result = with_timeout(timeout, "simple query", conn.execute(sql)).await?;
        Ok(result.rows_affected())
    }

    /// Prepare `stmt` and convert its parameters to the slot types the
    /// server inferred. The prepared statement lands in sqlx's per-connection
    /// cache, which the execution that follows reuses.
    async fn bind_types(&mut self, stmt: &Statement) -> DbResult<Vec<Bound>> {
        if stmt.params.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = self.command_timeout;
        let conn = self.raw()?;
        let prepared =
            with_timeout(timeout, "statement preparation", conn.prepare(&stmt.sql)).await?;
        let targets: &[PgTypeInfo] = match prepared.parameters() {
            Some(Either::Left(types)) => types,
            _ => &[],
        };
        stmt.params
            .iter()
            .enumerate()
            .map(|(i, param)| coerce(param, i + 1, targets.get(i)))
            .collect()
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.close_stale_cursors().await;
        self.log_statement(stmt);
        let params = self.bind_types(stmt).await?;
        self.statements += 1;
        let timeout = self.command_timeout;
        let conn = self.raw()?;
        let fut = bind_all(&stmt.sql, &params).execute(&mut *conn);
        let result = with_timeout(timeout, "statement execution", fut).await?;
        Ok(result.rows_affected())
    }

    /// Run a statement and decode every returned row.
    pub async fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        self.close_stale_cursors().await;
        self.log_statement(stmt);
        let params = self.bind_types(stmt).await?;
        self.statements += 1;
        let timeout = self.command_timeout;
        let conn = self.raw()?;
        let fut = bind_all(&stmt.sql, &params)
            .fetch(&mut *conn)
            .try_collect::<Vec<PgRow>>();
        let rows = with_timeout(timeout, "query execution", fut).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    /// Run a statement expected to return exactly one row.
    pub async fn fetch_one(&mut self, stmt: &Statement) -> DbResult<Row> {
        self.close_stale_cursors().await;
        self.log_statement(stmt);
        let params = self.bind_types(stmt).await?;
        self.statements += 1;
        let timeout = self.command_timeout;
        let conn = self.raw()?;
        let fut = bind_all(&stmt.sql, &params).fetch_one(&mut *conn);
        let row = with_timeout(timeout, "query execution", fut).await?;
        Ok(row.to_json_map())
    }

    /// Raw parameterized read.
    pub async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.fetch_all(&Statement::raw(sql, params.to_vec())).await
    }

    fn log_statement(&self, stmt: &Statement) {
        debug!(
            transaction_id = %self.id,
            sql = %stmt.sql,
            params = stmt.params.len(),
            in_transaction = self.in_transaction(),
            "Executing statement"
        );
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, operation: &str, fut: F) -> DbResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(DbError::from),
            Err(_) => Err(DbError::timeout(operation, limit.as_secs())),
        },
        None => fut.await.map_err(DbError::from),
    }
}

impl Drop for TxContext {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.state.is_open() || self.state == TransactionState::Acquiring {
            warn!(
                transaction_id = %self.id,
                state = %self.state,
                backend_pid = self.backend_pid,
                "Connection dropped mid-operation, closing it instead of returning it to the pool"
            );
            self.pool.forget(self.backend_pid);
            conn.close_on_drop();
        } else if self.pool.record_release(self.backend_pid, self.statements) {
            debug!(backend_pid = self.backend_pid, "Connection reached max_queries, closing");
            conn.close_on_drop();
        }
    }
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("backend_pid", &self.backend_pid)
            .field("statements", &self.statements)
            .finish()
    }
}
