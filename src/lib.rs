//! atomic-pg
//!
//! A small PostgreSQL data layer: shared connection pools keyed by settings,
//! keyword filters compiled to parameterized SQL, and an implicit-transaction
//! executor that lets nested operations share one transaction.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sql;

pub use config::{Cli, DatabaseSettings};
pub use db::{Atomic, DbAdapter, Outcome, Pool, PoolRegistry, Row, TxContext};
pub use error::{DbError, DbResult, FailureReport};
pub use models::{Columns, FilterSpec, OrderBy, QueryParam, SearchSpec, SelectOptions, ValueMap};
