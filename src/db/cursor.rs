//! Server-side cursor streaming.
//!
//! Rows are pulled with `DECLARE ... NO SCROLL CURSOR` and `FETCH n`, one batch
//! at a time, as the consumer polls. A stream is single-pass.

use crate::db::DbAdapter;
use crate::db::connection::TxContext;
use crate::db::types::Row;
use crate::error::{DbError, DbResult};
use crate::sql::Statement;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Where the cursor's connection comes from.
enum Source<'a> {
    /// Lease on first poll and own the transaction.
    Pending(DbAdapter),
    Owned(TxContext),
    Borrowed(&'a mut TxContext),
    /// Owned connection already released.
    Finished,
}

struct Cursor<'a> {
    source: Source<'a>,
    sql: String,
    name: String,
    batch_size: u32,
    buffer: VecDeque<Row>,
    declared: bool,
    exhausted: bool,
}

impl<'a> Cursor<'a> {
    fn new(source: Source<'a>, sql: String, batch_size: u32) -> Self {
        Self {
            source,
            sql,
            name: format!("cur_{}", uuid::Uuid::new_v4().simple()),
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            declared: false,
            exhausted: false,
        }
    }

    fn ctx(&mut self) -> DbResult<&mut TxContext> {
        match &mut self.source {
            Source::Owned(ctx) => Ok(ctx),
            Source::Borrowed(ctx) => Ok(&mut **ctx),
            Source::Pending(_) | Source::Finished => {
                Err(DbError::internal("cursor has no connection"))
            }
        }
    }

    async fn open(&mut self) -> DbResult<()> {
        if let Source::Pending(adapter) = &self.source {
            let ctx = adapter.begin().await?;
            self.source = Source::Owned(ctx);
        }

        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", self.name, self.sql);
        let ctx = self.ctx()?;
        if !ctx.in_transaction() {
            return Err(DbError::transaction(
                "cursor iteration needs an open transaction",
                ctx.id(),
            ));
        }
        ctx.simple(&declare).await?;
        self.declared = true;
        debug!(cursor = %self.name, sql = %self.sql, "Cursor declared");
        Ok(())
    }

    async fn fetch_batch(&mut self) -> DbResult<()> {
        let fetch = Statement::raw(format!("FETCH {} FROM {}", self.batch_size, self.name), Vec::new());
        let rows = self.ctx()?.fetch_all(&fetch).await?;
        if rows.len() < self.batch_size as usize {
            self.exhausted = true;
        }
        self.buffer.extend(rows);
        Ok(())
    }

    /// Close the cursor and, for an owned connection, commit and release it.
    async fn finish(&mut self) -> DbResult<()> {
        if self.declared {
            let close = format!("CLOSE {}", self.name);
            self.ctx()?.simple(&close).await?;
            self.declared = false;
        }
        if let Source::Owned(_) = self.source {
            let Source::Owned(mut ctx) = std::mem::replace(&mut self.source, Source::Finished)
            else {
                return Ok(());
            };
            ctx.commit().await?;
            ctx.release().await?;
        }
        Ok(())
    }

    /// Give up after an error. An owned connection is rolled back and released.
    async fn abort(&mut self) {
        self.exhausted = true;
        if let Source::Owned(_) = self.source {
            let Source::Owned(ctx) = std::mem::replace(&mut self.source, Source::Finished) else {
                return;
            };
            if let Err(e) = ctx.release().await {
                warn!(cursor = %self.name, error = %e, "Failed to release cursor connection");
            }
        }
    }

    async fn next_row(&mut self) -> Option<DbResult<Row>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.exhausted {
                return match self.finish().await {
                    Ok(()) => None,
                    Err(e) => {
                        self.abort().await;
                        Some(Err(e))
                    }
                };
            }
            let step = if self.declared {
                self.fetch_batch().await
            } else {
                self.open().await
            };
            if let Err(e) = step {
                self.abort().await;
                self.buffer.clear();
                self.declared = false;
                return Some(Err(e));
            }
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        // Dropped mid-stream inside the caller's transaction: the cursor would
        // stay open until commit, so the context closes it before its next
        // statement.
        if self.declared {
            if let Source::Borrowed(ctx) = &mut self.source {
                ctx.defer_cursor_close(std::mem::take(&mut self.name));
            }
        }
    }
}

/// Stream a query on a connection of its own.
pub(crate) fn stream_owned(
    adapter: DbAdapter,
    sql: String,
    batch_size: u32,
) -> BoxStream<'static, DbResult<Row>> {
    into_stream(Cursor::new(Source::Pending(adapter), sql, batch_size))
}

/// Stream a query inside the caller's transaction.
pub(crate) fn stream_in(
    ctx: &mut TxContext,
    sql: String,
    batch_size: u32,
) -> BoxStream<'_, DbResult<Row>> {
    into_stream(Cursor::new(Source::Borrowed(ctx), sql, batch_size))
}

fn into_stream(cursor: Cursor<'_>) -> BoxStream<'_, DbResult<Row>> {
    stream::unfold(Some(cursor), |state| async move {
        let mut cursor = state?;
        match cursor.next_row().await {
            Some(Ok(row)) => Some((Ok(row), Some(cursor))),
            // Errors end the stream.
            Some(Err(e)) => Some((Err(e), None)),
            None => None,
        }
    })
    .boxed()
}
