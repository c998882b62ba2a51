//! Database access layer.
//!
//! This module provides:
//! - The shared pool registry and connection leasing
//! - Leased connections with transaction state
//! - The implicit-transaction executor
//! - The table-level data adapter and cursor streaming
//! - Row decoding into JSON maps

pub mod adapter;
pub mod atomic;
pub mod connection;
mod cursor;
mod params;
pub mod registry;
pub mod types;

pub use adapter::DbAdapter;
pub use atomic::{Atomic, FailurePolicy, Outcome, Raise, Report};
pub use connection::{TransactionState, TxContext};
pub use registry::{Pool, PoolRegistry, SetupHook};
pub use types::{Row, RowToJson};
