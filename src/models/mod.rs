//! Data models for atomic-pg.
//!
//! This module re-exports all model types used throughout the crate.

pub mod filter;
pub mod query;

// Re-export commonly used types
pub use filter::{FilterSpec, FilterValue, Operator, SearchSpec, split_key};
pub use query::{
    Columns, Direction, Nulls, OrderBy, OrderTerm, QueryParam, SelectOptions, ValueMap,
};
