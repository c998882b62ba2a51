//! Process-wide connection pool registry.
//!
//! One pool exists per distinct [`DatabaseSettings`] value. Pools are created
//! lazily on first use and shared by every adapter built from equal settings.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per settings key**: single-flight pool creation, so concurrent
//!   first requests for the same settings end up with one pool
//! - **Lazy pools**: `connect_lazy_with` never touches the network; the first
//!   lease (or [`DbAdapter::connect`](crate::db::DbAdapter::connect)) surfaces
//!   connection errors
//! - **Backend pid lookup**: every lease asks the server for its backend pid.
//!   This replaces sqlx's own liveness ping and keys the per-connection
//!   statement counter used for `max_queries` rotation
//!
//! # Concurrency Safety
//!
//! - The registry map lock is never held across an await on pool creation
//!   or close; removed cells stay valid for callers that already cloned them
//! - The statement counter map uses a synchronous mutex held only for a
//!   lookup or an insert

use crate::config::DatabaseSettings;
use crate::db::connection::TxContext;
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

/// Async callback run on a connection each time it is leased.
pub type SetupHook = Arc<
    dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync,
>;

struct PoolInner {
    pg: PgPool,
    settings: DatabaseSettings,
    setup: Option<SetupHook>,
    /// Statements run so far, keyed by backend pid.
    usage: Mutex<HashMap<i32, u64>>,
}

/// Cheap-clone handle to a shared pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    fn new(settings: &DatabaseSettings, setup: Option<SetupHook>) -> DbResult<Self> {
        settings.validate()?;
        let options = settings.connect_options()?;
        let pg = PgPoolOptions::new()
            .min_connections(settings.min_size)
            .max_connections(settings.max_size)
            .acquire_timeout(settings.acquire_timeout())
            .test_before_acquire(false)
            .connect_lazy_with(options);

        Ok(Self {
            inner: Arc::new(PoolInner {
                pg,
                settings: settings.clone(),
                setup,
                usage: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.inner.settings
    }

    /// The underlying sqlx pool.
    pub fn pg(&self) -> &PgPool {
        &self.inner.pg
    }

    /// True when both handles refer to the same pool instance.
    pub fn same_pool(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open connections, idle or leased.
    pub fn size(&self) -> u32 {
        self.inner.pg.size()
    }

    pub fn num_idle(&self) -> usize {
        self.inner.pg.num_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pg.is_closed()
    }

    /// Lease a connection: acquire, look up its backend pid, run the setup hook.
    pub async fn acquire(&self) -> DbResult<TxContext> {
        let conn = self.inner.pg.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                self.inner.settings.acquire_timeout_secs,
            ),
            other => connection_error(&self.inner.settings, other),
        })?;
        let mut ctx = TxContext::acquiring(self.clone(), conn);
        ctx.prepare(self.inner.setup.as_ref()).await?;
        Ok(ctx)
    }

    /// Close the pool, waiting for leased connections to come back.
    pub async fn close(&self) {
        info!(database = %self.inner.settings.masked_url(), "Closing connection pool");
        self.inner.pg.close().await;
        self.usage().clear();
    }

    fn usage(&self) -> std::sync::MutexGuard<'_, HashMap<i32, u64>> {
        self.inner
            .usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn statements_for(&self, backend_pid: i32) -> u64 {
        self.usage().get(&backend_pid).copied().unwrap_or(0)
    }

    /// Record the statement count of a released connection.
    ///
    /// Returns true when the connection has used up `max_queries` and must be
    /// closed instead of returned.
    pub(crate) fn record_release(&self, backend_pid: i32, statements: u64) -> bool {
        let mut usage = self.usage();
        if statements >= self.inner.settings.max_queries {
            usage.remove(&backend_pid);
            true
        } else {
            usage.insert(backend_pid, statements);
            false
        }
    }

    pub(crate) fn forget(&self, backend_pid: i32) {
        self.usage().remove(&backend_pid);
    }

    pub(crate) fn max_queries(&self) -> u64 {
        self.inner.settings.max_queries
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("database", &self.inner.settings.masked_url())
            .field("size", &self.size())
            .field("idle", &self.num_idle())
            .field("has_setup", &self.inner.setup.is_some())
            .finish()
    }
}

/// Map a connect-time failure to a connection error naming the target.
pub(crate) fn connection_error(settings: &DatabaseSettings, err: sqlx::Error) -> DbError {
    let error_str = err.to_string().to_lowercase();
    let suggestion = if error_str.contains("password") || error_str.contains("authentication") {
        "Check the connection credentials are correct"
    } else if error_str.contains("does not exist") {
        "Verify the database name exists on the server"
    } else if error_str.contains("refused") || error_str.contains("timed out") {
        "Check the host and port, and that the server accepts connections"
    } else {
        "Check the connection settings"
    };
    DbError::connection(
        format!("Failed to connect to {}: {}", settings.masked_url(), err),
        suggestion,
    )
}

pub(crate) type Lease = PoolConnection<Postgres>;

/// Registry of pools keyed by settings.
#[derive(Default)]
pub struct PoolRegistry {
    /// Per-settings lazy pools. OnceCell ensures single-flight creation.
    pools: TokioRwLock<HashMap<DatabaseSettings, Arc<OnceCell<Pool>>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by adapters unless another is injected.
    pub fn shared() -> Arc<PoolRegistry> {
        static SHARED: OnceLock<Arc<PoolRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(PoolRegistry::new())))
    }

    /// Get or create the pool for `settings`.
    ///
    /// The setup hook is attached only when this call creates the pool.
    pub async fn get_pool(
        &self,
        settings: &DatabaseSettings,
        setup: Option<SetupHook>,
    ) -> DbResult<Pool> {
        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(settings) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                // Double-check after acquiring write lock
                if let Some(cell) = pools.get(settings) {
                    Arc::clone(cell)
                } else {
                    let cell = Arc::new(OnceCell::new());
                    pools.insert(settings.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let created = cell
            .get_or_try_init(|| async move {
                info!(
                    database = %settings.masked_url(),
                    min_size = settings.min_size,
                    max_size = settings.max_size,
                    max_queries = settings.max_queries,
                    "Creating connection pool"
                );
                Pool::new(settings, setup)
            })
            .await;

        match created {
            Ok(pool) => {
                debug!(database = %settings.masked_url(), "Returning connection pool");
                Ok(pool.clone())
            }
            Err(e) => {
                // Drop the empty cell so failed settings leave nothing behind.
                let mut pools = self.pools.write().await;
                if pools
                    .get(settings)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell) && current.get().is_none())
                {
                    pools.remove(settings);
                }
                Err(e)
            }
        }
    }

    /// Remove and close the pool for `settings`. Returns false if there was none.
    ///
    /// A pool still being created by a concurrent [`get_pool`](Self::get_pool)
    /// is waited for and closed too.
    pub async fn close_pool(&self, settings: &DatabaseSettings) -> bool {
        let cell = {
            let mut pools = self.pools.write().await;
            pools.remove(settings)
        };
        let pool = match cell.as_deref() {
            Some(cell) => settled(cell).await,
            None => None,
        };
        match pool {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => {
                warn!(database = %settings.masked_url(), "No pool to close");
                false
            }
        }
    }

    /// Close every pool.
    pub async fn close_all(&self) {
        // Drain pools under lock, close outside lock
        let pools_to_close: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, cell)| cell).collect()
        };

        for cell in pools_to_close {
            if let Some(pool) = settled(&cell).await {
                pool.close().await;
            }
        }
    }

    /// Number of initialized pools.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }
}

/// The cell's pool once any in-flight creation finishes, or `None` if it
/// never got one.
async fn settled(cell: &OnceCell<Pool>) -> Option<&Pool> {
    cell.get_or_try_init(|| async { Err(()) }).await.ok()
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(db: &str) -> DatabaseSettings {
        // Port 1 is never listening; lazy pools make no connection until leased.
        DatabaseSettings::new(db, "svc", "pw")
            .with_host("127.0.0.1", 1)
            .with_pool_size(0, 2)
    }

    #[tokio::test]
    async fn test_same_settings_share_pool() {
        let registry = PoolRegistry::new();
        let a = registry.get_pool(&settings("app"), None).await.unwrap();
        let b = registry.get_pool(&settings("app"), None).await.unwrap();
        assert!(a.same_pool(&b));
        assert_eq!(registry.pool_count().await, 1);
    }

    #[tokio::test]
    async fn test_different_settings_get_different_pools() {
        let registry = PoolRegistry::new();
        let a = registry.get_pool(&settings("app"), None).await.unwrap();
        let b = registry.get_pool(&settings("other"), None).await.unwrap();
        assert!(!a.same_pool(&b));
        assert_eq!(registry.pool_count().await, 2);
    }

    #[tokio::test]
    async fn test_close_pool_then_recreate() {
        let registry = PoolRegistry::new();
        let first = registry.get_pool(&settings("app"), None).await.unwrap();
        assert!(registry.close_pool(&settings("app")).await);
        assert!(first.is_closed());
        assert_eq!(registry.pool_count().await, 0);

        let second = registry.get_pool(&settings("app"), None).await.unwrap();
        assert!(!first.same_pool(&second));
        assert!(!second.is_closed());
        assert!(!registry.close_pool(&settings("missing")).await);
    }

    #[tokio::test]
    async fn test_invalid_settings_leave_no_pool() {
        let registry = PoolRegistry::new();
        let bad = settings("app").with_pool_size(3, 1);
        assert!(matches!(
            registry.get_pool(&bad, None).await,
            Err(DbError::Configuration { .. })
        ));
        assert_eq!(registry.pool_count().await, 0);
        assert!(registry.pools.read().await.is_empty());

        // The same settings fixed afterwards still get a pool.
        let good = registry.get_pool(&settings("app"), None).await.unwrap();
        assert!(!good.is_closed());
        assert_eq!(registry.pools.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_settled_cell() {
        let cell = OnceCell::new();
        assert!(settled(&cell).await.is_none());
        assert!(!cell.initialized());

        let registry = PoolRegistry::new();
        let pool = registry.get_pool(&settings("app"), None).await.unwrap();
        let cell = OnceCell::new_with(Some(pool.clone()));
        assert!(settled(&cell).await.is_some_and(|p| p.same_pool(&pool)));
    }

    #[tokio::test]
    async fn test_record_release_rotates_at_max_queries() {
        let registry = PoolRegistry::new();
        let pool = registry
            .get_pool(&settings("app").with_max_queries(3), None)
            .await
            .unwrap();
        assert!(!pool.record_release(42, 2));
        assert_eq!(pool.statements_for(42), 2);
        assert!(pool.record_release(42, 3));
        assert_eq!(pool.statements_for(42), 0);
    }

    #[tokio::test]
    async fn test_acquire_unreachable_is_connection_error() {
        let registry = PoolRegistry::new();
        let mut s = settings("app");
        s.acquire_timeout_secs = 2;
        let pool = registry.get_pool(&s, None).await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
