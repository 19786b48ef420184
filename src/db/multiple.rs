//! Multi-result cursor.
//!
//! Each statement of a multi-statement command is one result set, in order.
//! Every set can be read once; the cursor looks one item ahead so that
//! [`MultipleResult::is_consumed`] is accurate after each read.

use crate::db::connection::CommandContext;
use crate::error::{DbError, DbResult};
use futures_util::StreamExt;
use futures_util::stream::{BoxStream, Peekable};
use sqlx::sqlite::{SqliteQueryResult, SqliteRow};
use sqlx::{Either, FromRow};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ResultStream<'c> = BoxStream<'c, Result<Either<SqliteQueryResult, SqliteRow>, sqlx::Error>>;

/// Sequential reader over the result sets of one command.
///
/// Borrows its connection, so it cannot outlive it. Dropping the cursor
/// discards any unread sets.
pub struct MultipleResult<'c> {
    stream: Peekable<ResultStream<'c>>,
    context: &'c CommandContext,
    cancellation: Option<CancellationToken>,
    result_sets_read: usize,
    consumed: bool,
}

/// Pull the rows of the current result set, up to its terminating summary.
async fn collect_set(stream: &mut Peekable<ResultStream<'_>>) -> Result<Vec<SqliteRow>, sqlx::Error> {
    let mut rows = Vec::new();
    while let Some(item) = stream.next().await {
        match item? {
            Either::Right(row) => rows.push(row),
            Either::Left(_) => break,
        }
    }
    Ok(rows)
}

fn map_rows<T>(rows: Vec<SqliteRow>) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow>,
{
    rows.iter()
        .map(|row| T::from_row(row).map_err(DbError::from))
        .collect()
}

impl<'c> MultipleResult<'c> {
    pub(crate) async fn open(
        stream: ResultStream<'c>,
        context: &'c CommandContext,
        cancellation: Option<CancellationToken>,
    ) -> DbResult<Self> {
        let mut cursor = Self {
            stream: stream.peekable(),
            context,
            cancellation,
            result_sets_read: 0,
            consumed: false,
        };
        cursor.look_ahead().await?;
        Ok(cursor)
    }

    /// True once every result set has been read, or after an error.
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Number of result sets read so far.
    pub fn result_sets_read(&self) -> usize {
        self.result_sets_read
    }

    async fn look_ahead(&mut self) -> DbResult<()> {
        let stream = &mut self.stream;
        let pending = self
            .context
            .run(
                "result set read",
                self.cancellation.as_ref(),
                async { Ok::<_, DbError>(Pin::new(stream).peek().await.is_some()) },
            )
            .await;
        match pending {
            Ok(has_more) => {
                self.consumed = !has_more;
                Ok(())
            }
            Err(e) => {
                self.consumed = true;
                Err(e)
            }
        }
    }

    async fn next_set(&mut self) -> DbResult<Vec<SqliteRow>> {
        if self.consumed {
            return Err(DbError::cursor_consumed(self.result_sets_read));
        }
        let rows = self
            .context
            .run(
                "result set read",
                self.cancellation.as_ref(),
                collect_set(&mut self.stream),
            )
            .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                self.consumed = true;
                return Err(e);
            }
        };
        self.result_sets_read += 1;
        debug!(
            session_id = %self.context.session_id(),
            result_set = self.result_sets_read,
            rows = rows.len(),
            "Read result set"
        );
        self.look_ahead().await?;
        Ok(rows)
    }

    /// Read the next set: its only row, `None` when empty, an error for two or more.
    pub async fn read_single_or_default<T>(&mut self) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        let rows = self.next_set().await?;
        if rows.len() > 1 {
            return Err(DbError::database(
                "Result set contained more than one row",
                None,
                "Use read_first_or_default, or narrow the statement to match at most one row",
            ));
        }
        Ok(map_rows(rows)?.into_iter().next())
    }

    /// Read the next set and return its first row, if any.
    pub async fn read_first_or_default<T>(&mut self) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        let mut rows = self.next_set().await?;
        rows.truncate(1);
        Ok(map_rows(rows)?.into_iter().next())
    }

    /// Read every row of the next set.
    pub async fn read<T>(&mut self) -> DbResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow>,
    {
        let rows = self.next_set().await?;
        map_rows(rows)
    }
}

impl std::fmt::Debug for MultipleResult<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipleResult")
            .field("session_id", &self.context.session_id())
            .field("result_sets_read", &self.result_sets_read)
            .field("consumed", &self.consumed)
            .finish()
    }
}
