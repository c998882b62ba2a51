//! Data adapter: table-level CRUD on top of the pool registry.
//!
//! Every operation takes `ctx: Option<&mut TxContext>`. With `Some` the
//! statement runs on the caller's connection, inside its transaction. With
//! `None` writes run in a pooled transaction of their own and reads run on a
//! pooled connection. Statements are built before any connection is leased,
//! so malformed requests never touch the database.

use crate::config::{DEFAULT_FETCH_SIZE, DatabaseSettings, load_settings};
use crate::db::atomic::{Atomic, Raise, Report};
use crate::db::connection::TxContext;
use crate::db::cursor;
use crate::db::registry::{Pool, PoolRegistry, SetupHook};
use crate::db::types::Row;
use crate::error::DbResult;
use crate::models::{FilterSpec, QueryParam, SearchSpec, SelectOptions, ValueMap};
use crate::sql::Statement;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Handle for running statements against one database.
///
/// Cheap to clone. Adapters built from equal settings share a pool.
#[derive(Clone)]
pub struct DbAdapter {
    settings: Arc<DatabaseSettings>,
    registry: Arc<PoolRegistry>,
    setup: Option<SetupHook>,
}

impl DbAdapter {
    /// Adapter on the process-wide registry.
    pub fn new(settings: DatabaseSettings) -> Self {
        Self::with_registry(settings, PoolRegistry::shared())
    }

    pub fn with_registry(settings: DatabaseSettings, registry: Arc<PoolRegistry>) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            setup: None,
        }
    }

    /// Adapter from the `DATABASE_SETTINGS` section of a config file.
    pub fn from_config_file(path: Option<&Path>) -> DbResult<Self> {
        Ok(Self::new(load_settings(path)?))
    }

    /// Run `hook` on every leased connection. Takes effect only if this adapter
    /// is the one that creates the pool.
    pub fn with_setup(mut self, hook: SetupHook) -> Self {
        self.setup = Some(hook);
        self
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// The shared pool for this adapter's settings, created on first use.
    pub async fn pool(&self) -> DbResult<Pool> {
        self.registry.get_pool(&self.settings, self.setup.clone()).await
    }

    /// Make one round trip to check the database is reachable.
    pub async fn connect(&self) -> DbResult<Pool> {
        let pool = self.pool().await?;
        let mut ctx = pool.acquire().await?;
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(ctx.connection()?)
            .await?;
        info!(
            database = %self.settings.masked_url(),
            server_version = %version,
            "Connected to PostgreSQL"
        );
        ctx.release().await?;
        Ok(pool)
    }

    /// Close this adapter's pool. Other adapters with equal settings lose it too.
    pub async fn close(&self) -> bool {
        self.registry.close_pool(&self.settings).await
    }

    /// Lease a connection without opening a transaction.
    pub async fn acquire(&self) -> DbResult<TxContext> {
        self.pool().await?.acquire().await
    }

    /// Lease a connection and open a transaction on it.
    pub async fn begin(&self) -> DbResult<TxContext> {
        let mut ctx = self.acquire().await?;
        ctx.begin().await?;
        Ok(ctx)
    }

    /// Atomic executor that propagates failures.
    pub fn atomic(&self) -> Atomic<Raise> {
        Atomic::new(self.clone(), Raise)
    }

    /// Atomic executor that reports failures as values.
    pub fn atomic_report(&self) -> Atomic<Report> {
        Atomic::new(self.clone(), Report::new())
    }

    /// Insert one row and return it as stored.
    pub async fn insert(
        &self,
        ctx: Option<&mut TxContext>,
        table: &str,
        values: &ValueMap,
    ) -> DbResult<Row> {
        let stmt = Statement::insert(table, values)?;
        self.write(ctx, move |tx| Box::pin(async move { tx.fetch_one(&stmt).await }))
            .await
    }

    pub async fn select(
        &self,
        ctx: Option<&mut TxContext>,
        table: &str,
        options: &SelectOptions,
    ) -> DbResult<Vec<Row>> {
        let stmt = Statement::select(table, options)?;
        self.read(ctx, move |tx| Box::pin(async move { tx.fetch_all(&stmt).await }))
            .await
    }

    /// Filtered read. See [`FilterSpec`] for the key grammar.
    pub async fn where_(
        &self,
        ctx: Option<&mut TxContext>,
        table: &str,
        filters: &FilterSpec,
        search: Option<&SearchSpec>,
        options: &SelectOptions,
    ) -> DbResult<Vec<Row>> {
        let stmt = Statement::select_where(table, filters, search, options)?;
        self.read(ctx, move |tx| Box::pin(async move { tx.fetch_all(&stmt).await }))
            .await
    }

    /// Update rows matching equality filters and return them.
    pub async fn update(
        &self,
        ctx: Option<&mut TxContext>,
        table: &str,
        filters: &FilterSpec,
        values: &ValueMap,
    ) -> DbResult<Vec<Row>> {
        let stmt = Statement::update(table, filters, values)?;
        self.write(ctx, move |tx| Box::pin(async move { tx.fetch_all(&stmt).await }))
            .await
    }

    /// Delete rows matching `filters`. Empty filters are refused; use
    /// [`delete_all`](Self::delete_all).
    pub async fn delete(
        &self,
        ctx: Option<&mut TxContext>,
        table: &str,
        filters: &FilterSpec,
    ) -> DbResult<u64> {
        let stmt = Statement::delete(table, filters)?;
        self.write(ctx, move |tx| Box::pin(async move { tx.execute(&stmt).await }))
            .await
    }

    pub async fn delete_all(&self, ctx: Option<&mut TxContext>, table: &str) -> DbResult<u64> {
        let stmt = Statement::delete_all(table)?;
        self.write(ctx, move |tx| Box::pin(async move { tx.execute(&stmt).await }))
            .await
    }

    /// Run raw SQL over the simple protocol. Several statements are allowed.
    pub async fn execute(&self, ctx: Option<&mut TxContext>, sql: &str) -> DbResult<u64> {
        let sql = sql.to_string();
        self.write(ctx, move |tx| Box::pin(async move { tx.simple(&sql).await }))
            .await
    }

    /// Raw parameterized read.
    pub async fn fetch(
        &self,
        ctx: Option<&mut TxContext>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let stmt = Statement::raw(sql, params.to_vec());
        self.read(ctx, move |tx| Box::pin(async move { tx.fetch_all(&stmt).await }))
            .await
    }

    /// Stream rows through a server-side cursor on a connection of its own.
    ///
    /// Nothing is sent until the stream is first polled. Dropping the stream
    /// early closes its connection.
    pub fn iterate(&self, sql: &str) -> BoxStream<'static, DbResult<Row>> {
        self.iterate_with(sql, DEFAULT_FETCH_SIZE)
    }

    pub fn iterate_with(&self, sql: &str, batch_size: u32) -> BoxStream<'static, DbResult<Row>> {
        cursor::stream_owned(self.clone(), sql.to_string(), batch_size)
    }

    /// Stream rows inside the caller's open transaction.
    ///
    /// Dropping the stream early leaves its cursor open until the context
    /// runs its next statement, which closes it first.
    pub fn iterate_in<'a>(
        &self,
        ctx: &'a mut TxContext,
        sql: &str,
    ) -> BoxStream<'a, DbResult<Row>> {
        cursor::stream_in(ctx, sql.to_string(), DEFAULT_FETCH_SIZE)
    }

    async fn write<T, F>(&self, ctx: Option<&mut TxContext>, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        self.atomic().run(ctx, work).await
    }

    async fn read<T, F>(&self, ctx: Option<&mut TxContext>, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        match ctx {
            Some(tx) => work(tx).await,
            None => {
                let mut tx = self.acquire().await?;
                let result = work(&mut tx).await;
                let released = tx.release().await;
                let value = result?;
                released?;
                Ok(value)
            }
        }
    }
}

impl fmt::Debug for DbAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbAdapter")
            .field("settings", &self.settings)
            .field("has_setup", &self.setup.is_some())
            .finish()
    }
}
