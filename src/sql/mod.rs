//! SQL text generation.
//!
//! Nothing here touches a connection. Values never appear in generated text;
//! they are collected into a [`Bindings`] list and referenced as `$n`.

pub mod predicate;
pub mod statement;

pub use predicate::Predicate;
pub use statement::Statement;

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `name` is a plain identifier or `schema.name`.
///
/// Identifiers are interpolated into SQL text, so anything outside
/// `[A-Za-z_][A-Za-z0-9_$]*` is rejected rather than quoted.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        if parts > 2 || !is_plain_identifier(part) {
            return Err(DbError::invalid_identifier(name));
        }
    }
    Ok(())
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Ordered parameter list with `$n` placeholder numbering.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Bindings {
    params: Vec<QueryParam>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value and return its placeholder.
    pub fn push(&mut self, value: QueryParam) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> Vec<QueryParam> {
        self.params
    }
}

/// Count distinct `$n` placeholders in generated SQL.
#[cfg(test)]
pub(crate) fn placeholder_count(sql: &str) -> usize {
    let mut seen = std::collections::BTreeSet::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                seen.insert(&sql[start..end]);
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    seen.len()
}
