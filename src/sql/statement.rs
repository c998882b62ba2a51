//! INSERT / SELECT / UPDATE / DELETE builders.

use crate::error::{DbError, DbResult};
use crate::models::{Columns, FilterSpec, QueryParam, SearchSpec, SelectOptions, ValueMap};
use crate::sql::predicate::{compile_equality_into, compile_into};
use crate::sql::{Bindings, validate_identifier};

/// SQL text plus the parameters its placeholders refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    fn new(sql: String, bindings: Bindings) -> Self {
        Self {
            sql,
            params: bindings.into_params(),
        }
    }

    /// `INSERT INTO t (c1, c2) VALUES ($1, $2) RETURNING *`
    ///
    /// Null values are written as a `NULL` literal so the column type decides.
    pub fn insert(table: &str, values: &ValueMap) -> DbResult<Self> {
        validate_identifier(table)?;
        if values.is_empty() {
            return Err(DbError::empty_column_set("insert", table));
        }

        let mut bindings = Bindings::new();
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (column, value) in values.iter() {
            validate_identifier(column)?;
            columns.push(column);
            placeholders.push(if value.is_null() {
                "NULL".to_string()
            } else {
                bindings.push(value.clone())
            });
        }

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok(Self::new(sql, bindings))
    }

    /// Unfiltered read.
    pub fn select(table: &str, options: &SelectOptions) -> DbResult<Self> {
        Self::select_where(table, &FilterSpec::new(), None, options)
    }

    /// `SELECT cols FROM t [WHERE ...] [ORDER BY ...] [OFFSET $n] [LIMIT $m]`
    pub fn select_where(
        table: &str,
        filters: &FilterSpec,
        search: Option<&SearchSpec>,
        options: &SelectOptions,
    ) -> DbResult<Self> {
        validate_identifier(table)?;
        let columns = match &options.columns {
            Columns::All => "*".to_string(),
            Columns::List(list) if list.is_empty() => "*".to_string(),
            Columns::List(list) => {
                for column in list {
                    validate_identifier(column)?;
                }
                list.join(", ")
            }
        };

        let mut bindings = Bindings::new();
        let predicate = compile_into(filters, search, &mut bindings)?;

        let mut sql = format!("SELECT {columns} FROM {table}");
        if !predicate.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
        if !options.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&options.order_by.to_sql());
        }
        if let Some(offset) = options.offset {
            let p = bindings.push(QueryParam::Int(offset));
            sql.push_str(&format!(" OFFSET {p}"));
        }
        if let Some(limit) = options.limit {
            let p = bindings.push(QueryParam::Int(limit));
            sql.push_str(&format!(" LIMIT {p}"));
        }
        Ok(Self::new(sql, bindings))
    }

    /// `UPDATE t SET c1 = $1, c2 = NULL WHERE w = $2 RETURNING *`
    ///
    /// The where-filter is equality only. An empty where-filter updates every row.
    pub fn update(table: &str, filters: &FilterSpec, values: &ValueMap) -> DbResult<Self> {
        validate_identifier(table)?;
        if values.is_empty() {
            return Err(DbError::empty_column_set("update", table));
        }

        let mut bindings = Bindings::new();
        let mut assignments = Vec::with_capacity(values.len());
        for (column, value) in values.iter() {
            validate_identifier(column)?;
            if value.is_null() {
                assignments.push(format!("{column} = NULL"));
            } else {
                assignments.push(format!("{column} = {}", bindings.push(value.clone())));
            }
        }

        let predicate = compile_equality_into(filters, &mut bindings)?;
        let mut sql = format!("UPDATE {table} SET {}", assignments.join(", "));
        if !predicate.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }
        sql.push_str(" RETURNING *");
        Ok(Self::new(sql, bindings))
    }

    /// `DELETE FROM t WHERE ...`. Empty filters are refused.
    pub fn delete(table: &str, filters: &FilterSpec) -> DbResult<Self> {
        validate_identifier(table)?;
        if filters.is_empty() {
            return Err(DbError::missing_predicate(table));
        }
        let mut bindings = Bindings::new();
        let predicate = compile_into(filters, None, &mut bindings)?;
        Ok(Self::new(
            format!("DELETE FROM {table} WHERE {predicate}"),
            bindings,
        ))
    }

    /// Unconditional `DELETE FROM t`.
    pub fn delete_all(table: &str) -> DbResult<Self> {
        validate_identifier(table)?;
        Ok(Self {
            sql: format!("DELETE FROM {table}"),
            params: Vec::new(),
        })
    }

    /// Caller-written SQL with positional parameters.
    pub fn raw(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}
