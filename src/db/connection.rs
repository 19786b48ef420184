//! Connection abstraction and the uniform query surface.
//!
//! [`SqliteConnection`] wraps one live driver session. [`SqliteTransaction`]
//! borrows a connection for the life of a transaction. Both implement
//! [`SqlExecutor`], which carries every query operation:
//!
//! - `query_single_or_default`: zero or one row, more is an error
//! - `query_first_or_default`: first row, if any
//! - `query`: every row, buffered
//! - `execute_scalar`: first column of the first row
//! - `execute`: affected row count
//! - `query_multiple`: a cursor over one result set per statement
//!
//! Every operation is bounded by the connection's command timeout and by the
//! command's cancellation token. An interrupted operation aborts the session:
//! its handle stops counting as open at once, the connection drops the driver
//! session as soon as it is no longer borrowed, and later operations fail with
//! a connection error.

use crate::db::coercion::TypeCoercions;
use crate::db::factory::SessionGuard;
use crate::db::multiple::MultipleResult;
use crate::db::params::build_arguments;
use crate::error::{DbError, DbResult};
use crate::models::Command;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Connection, Decode, FromRow, Sqlite, Type};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Run `fut` bounded by `limit` and, when given, by `cancel`.
///
/// A zero `limit` means no timeout. Cancellation wins when both are ready.
pub(crate) async fn bounded<T, E, F>(
    operation: &str,
    limit: Duration,
    cancel: Option<&CancellationToken>,
    fut: F,
) -> DbResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<DbError>,
{
    let limited = async {
        if limit.is_zero() {
            return fut.await.map_err(Into::into);
        }
        match timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(DbError::timeout(operation, limit.as_secs())),
        }
    };

    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DbError::cancelled(operation)),
                result = limited => result,
            }
        }
        None => limited.await,
    }
}

/// Per-connection command settings, shared with transactions and cursors.
#[derive(Debug)]
pub struct CommandContext {
    timeout: Duration,
    coercions: TypeCoercions,
    session_id: Uuid,
    aborted: AtomicBool,
    guard: Option<SessionGuard>,
}

impl CommandContext {
    pub(crate) fn new(timeout: Duration, coercions: TypeCoercions, session_id: Uuid) -> Self {
        Self {
            timeout,
            coercions,
            session_id,
            aborted: AtomicBool::new(false),
            guard: None,
        }
    }

    /// Tie the factory's open-session count to this context.
    pub(crate) fn with_guard(mut self, guard: SessionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    fn release_guard(&self) {
        if let Some(guard) = &self.guard {
            guard.release();
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn coercions(&self) -> &TypeCoercions {
        &self.coercions
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// True once an operation on the session was interrupted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Run a backend operation under this session's timeout.
    /// Interruption marks the session aborted and releases its handle.
    pub(crate) async fn run<T, E, F>(
        &self,
        operation: &str,
        cancel: Option<&CancellationToken>,
        fut: F,
    ) -> DbResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<DbError>,
    {
        let result = bounded(operation, self.timeout, cancel, fut).await;
        if let Err(err) = &result {
            if err.is_interrupted() {
                warn!(session_id = %self.session_id, error = %err, "Aborting SQLite session");
                self.aborted.store(true, Ordering::SeqCst);
                self.release_guard();
            }
        }
        result
    }
}

fn closed_error() -> DbError {
    DbError::connection(
        "Connection is closed",
        "Open a new connection from the factory",
    )
}

/// Borrowed view of a live session, handed to the query operations.
#[doc(hidden)]
pub struct Session<'a> {
    pub(crate) conn: &'a mut sqlx::SqliteConnection,
    pub(crate) context: &'a CommandContext,
}

/// The uniform query surface.
///
/// Row types implement [`sqlx::FromRow`]; scalars implement [`sqlx::Decode`] and
/// [`sqlx::Type`]. Zero rows map to `None`.
#[allow(async_fn_in_trait)]
pub trait SqlExecutor {
    #[doc(hidden)]
    fn session(&mut self) -> DbResult<Session<'_>>;

    /// Release the session if an operation aborted it.
    #[doc(hidden)]
    fn release_if_aborted(&mut self);

    /// Return the only row, `None` for zero rows, or an error for two or more.
    async fn query_single_or_default<T>(&mut self, command: &Command) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let result = match self.session() {
            Ok(Session { conn, context }) => fetch_single(conn, context, command).await,
            Err(e) => Err(e),
        };
        self.release_if_aborted();
        result
    }

    /// Return the first row, or `None` when there are no rows.
    async fn query_first_or_default<T>(&mut self, command: &Command) -> DbResult<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let result = match self.session() {
            Ok(Session { conn, context }) => fetch_first(conn, context, command).await,
            Err(e) => Err(e),
        };
        self.release_if_aborted();
        result
    }

    /// Return every row.
    async fn query<T>(&mut self, command: &Command) -> DbResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let result = match self.session() {
            Ok(Session { conn, context }) => fetch_all(conn, context, command).await,
            Err(e) => Err(e),
        };
        self.release_if_aborted();
        result
    }

    /// Return the first column of the first row. NULL and no rows are `None`.
    async fn execute_scalar<T>(&mut self, command: &Command) -> DbResult<Option<T>>
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite> + Send + Unpin,
    {
        let result = match self.session() {
            Ok(Session { conn, context }) => fetch_scalar(conn, context, command).await,
            Err(e) => Err(e),
        };
        self.release_if_aborted();
        result
    }

    /// Execute a non-query command and return the number of affected rows.
    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        let result = match self.session() {
            Ok(Session { conn, context }) => execute_command(conn, context, command).await,
            Err(e) => Err(e),
        };
        self.release_if_aborted();
        result
    }

    /// Execute a multi-statement command and return a cursor over its result
    /// sets. The cursor borrows the connection until dropped.
    async fn query_multiple<'c>(&'c mut self, command: &'c Command) -> DbResult<MultipleResult<'c>> {
        let Session { conn, context } = self.session()?;
        let args = build_arguments(command, &context.coercions)?;
        log_command("query_multiple", context, command);
        // Multi-statement batches are SQLite-only in sqlx and flagged deprecated there.
        #[allow(deprecated)]
        let stream = sqlx::Executor::fetch_many(conn, sqlx::query_with(command.sql(), args));
        MultipleResult::open(stream, context, command.cancellation().cloned()).await
    }
}

fn log_command(operation: &str, context: &CommandContext, command: &Command) {
    debug!(
        session_id = %context.session_id,
        sql = %command.sql(),
        params = command.placeholders().len(),
        timeout_secs = context.timeout.as_secs(),
        "Executing {}",
        operation
    );
}

fn prepare<'q>(
    operation: &str,
    context: &CommandContext,
    command: &Command,
) -> DbResult<SqliteArguments<'q>> {
    let args = build_arguments(command, &context.coercions)?;
    log_command(operation, context, command);
    Ok(args)
}

async fn fetch_single<T>(
    conn: &mut sqlx::SqliteConnection,
    context: &CommandContext,
    command: &Command,
) -> DbResult<Option<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let args = prepare("query_single_or_default", context, command)?;
    let rows: Vec<T> = context
        .run(
            "query execution",
            command.cancellation(),
            sqlx::query_as_with::<_, T, _>(command.sql(), args)
                .fetch(&mut *conn)
                .take(2)
                .try_collect(),
        )
        .await?;
    if rows.len() > 1 {
        return Err(DbError::database(
            "Query returned more than one row",
            None,
            "Use query_first_or_default, or narrow the WHERE clause to match at most one row",
        ));
    }
    Ok(rows.into_iter().next())
}

async fn fetch_first<T>(
    conn: &mut sqlx::SqliteConnection,
    context: &CommandContext,
    command: &Command,
) -> DbResult<Option<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let args = prepare("query_first_or_default", context, command)?;
    context
        .run(
            "query execution",
            command.cancellation(),
            sqlx::query_as_with::<_, T, _>(command.sql(), args).fetch_optional(&mut *conn),
        )
        .await
}

async fn fetch_all<T>(
    conn: &mut sqlx::SqliteConnection,
    context: &CommandContext,
    command: &Command,
) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let args = prepare("query", context, command)?;
    context
        .run(
            "query execution",
            command.cancellation(),
            sqlx::query_as_with::<_, T, _>(command.sql(), args).fetch_all(&mut *conn),
        )
        .await
}

async fn fetch_scalar<T>(
    conn: &mut sqlx::SqliteConnection,
    context: &CommandContext,
    command: &Command,
) -> DbResult<Option<T>>
where
    T: for<'r> Decode<'r, Sqlite> + Type<Sqlite> + Send + Unpin,
{
    let args = prepare("execute_scalar", context, command)?;
    let value: Option<Option<T>> = context
        .run(
            "scalar query",
            command.cancellation(),
            sqlx::query_scalar_with::<_, Option<T>, _>(command.sql(), args)
                .fetch_optional(&mut *conn),
        )
        .await?;
    Ok(value.flatten())
}

async fn execute_command(
    conn: &mut sqlx::SqliteConnection,
    context: &CommandContext,
    command: &Command,
) -> DbResult<u64> {
    let args = prepare("execute", context, command)?;
    let result = context
        .run(
            "write operation",
            command.cancellation(),
            sqlx::query_with(command.sql(), args).execute(&mut *conn),
        )
        .await?;
    Ok(result.rows_affected())
}

/// One live SQLite session with its default command timeout.
///
/// Owned by a single unit of work. Close it with [`close`](Self::close); dropping
/// it also releases the session.
#[derive(Debug)]
pub struct SqliteConnection {
    session: Option<sqlx::SqliteConnection>,
    context: CommandContext,
}

impl SqliteConnection {
    pub(crate) fn new(session: sqlx::SqliteConnection, context: CommandContext) -> Self {
        Self {
            session: Some(session),
            context,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.context.session_id
    }

    /// Default timeout applied to every command.
    pub fn command_timeout(&self) -> Duration {
        self.context.timeout
    }

    pub fn coercions(&self) -> &TypeCoercions {
        &self.context.coercions
    }

    /// False after [`close`](Self::close) or after an interrupted operation.
    pub fn is_open(&self) -> bool {
        self.session.is_some() && !self.context.is_aborted()
    }

    /// Start a transaction. Commit or roll it back explicitly; dropping it
    /// uncommitted rolls back.
    pub async fn begin_transaction(
        &mut self,
        cancel: &CancellationToken,
    ) -> DbResult<SqliteTransaction<'_>> {
        let Session { conn, context } = self.session()?;
        let tx = context
            .run("begin transaction", Some(cancel), conn.begin())
            .await?;
        debug!(session_id = %context.session_id, "Transaction started");
        Ok(SqliteTransaction {
            tx: Some(tx),
            context,
        })
    }

    /// Close the session. Calling it again is a no-op.
    pub async fn close(&mut self) -> DbResult<()> {
        let session = self.session.take();
        self.context.release_guard();
        match session {
            Some(session) if !self.context.is_aborted() => {
                session.close().await?;
                debug!(session_id = %self.context.session_id, "Closed SQLite connection");
            }
            _ => {}
        }
        Ok(())
    }

    fn abort(&mut self) {
        if self.session.take().is_some() {
            self.context.release_guard();
            debug!(session_id = %self.context.session_id, "Released aborted SQLite session");
        }
    }
}

impl SqlExecutor for SqliteConnection {
    fn session(&mut self) -> DbResult<Session<'_>> {
        if self.context.is_aborted() {
            self.abort();
        }
        let conn = self.session.as_mut().ok_or_else(closed_error)?;
        Ok(Session {
            conn,
            context: &self.context,
        })
    }

    fn release_if_aborted(&mut self) {
        if self.context.is_aborted() {
            self.abort();
        }
    }
}

/// A transaction on a borrowed [`SqliteConnection`].
pub struct SqliteTransaction<'c> {
    tx: Option<sqlx::Transaction<'c, Sqlite>>,
    context: &'c CommandContext,
}

impl<'c> SqliteTransaction<'c> {
    pub fn session_id(&self) -> Uuid {
        self.context.session_id
    }

    fn take_live(&mut self) -> DbResult<sqlx::Transaction<'c, Sqlite>> {
        if self.context.is_aborted() {
            self.tx = None;
        }
        self.tx.take().ok_or_else(closed_error)
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> DbResult<()> {
        let context = self.context;
        let tx = self.take_live()?;
        context.run("commit", None, tx.commit()).await?;
        debug!(session_id = %context.session_id, "Transaction committed");
        Ok(())
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> DbResult<()> {
        let context = self.context;
        let tx = self.take_live()?;
        context.run("rollback", None, tx.rollback()).await?;
        debug!(session_id = %context.session_id, "Transaction rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("session_id", &self.context.session_id)
            .field("active", &self.tx.is_some())
            .finish()
    }
}

impl SqlExecutor for SqliteTransaction<'_> {
    fn session(&mut self) -> DbResult<Session<'_>> {
        if self.context.is_aborted() {
            self.tx = None;
        }
        let tx = self.tx.as_mut().ok_or_else(closed_error)?;
        Ok(Session {
            conn: &mut **tx,
            context: self.context,
        })
    }

    fn release_if_aborted(&mut self) {
        if self.context.is_aborted() {
            self.tx = None;
        }
    }
}
