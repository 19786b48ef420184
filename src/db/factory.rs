//! Connection factory.
//!
//! A factory holds one instance's resolved options and opens a new
//! [`SqliteConnection`] per unit of work. It keeps no pool; the only state it
//! tracks is how many sessions it has handed out that are still alive.

use crate::db::coercion::TypeCoercions;
use crate::db::connection::{CommandContext, SqliteConnection, bounded};
use crate::db::connection_string::parse_connection_string;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionOptions;
use sqlx::Connection;
use sqlx::sqlite::SqliteConnectOptions;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Counts one live session until it is released or dropped.
pub(crate) struct SessionGuard {
    open: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl SessionGuard {
    pub(crate) fn new(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            open,
            released: AtomicBool::new(false),
        }
    }

    /// Stop counting the session. Only the first call decrements.
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("open", &self.open.load(Ordering::SeqCst))
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Produces connections for one configured SQLite instance.
///
/// Immutable after construction and safe to share across tasks behind an `Arc`.
pub struct SqliteConnectionFactory {
    connect_options: SqliteConnectOptions,
    command_timeout: Duration,
    coercions: TypeCoercions,
    open_sessions: Arc<AtomicUsize>,
}

impl SqliteConnectionFactory {
    /// Validate and parse the options. Fails before any I/O when the
    /// connection string is missing, blank or malformed.
    pub fn new(options: ConnectionOptions) -> DbResult<Self> {
        let connection_string = options
            .connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DbError::configuration("ConnectionString is required."))?;
        let connect_options = parse_connection_string(connection_string)?;

        Ok(Self {
            connect_options,
            command_timeout: Duration::from_secs(options.command_timeout_secs),
            coercions: options.coercions,
            open_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Default timeout applied to every command on connections from this factory.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn command_timeout_secs(&self) -> u64 {
        self.command_timeout.as_secs()
    }

    pub fn coercions(&self) -> TypeCoercions {
        self.coercions
    }

    /// Sessions opened by this factory that have not been closed or dropped.
    pub fn open_connections(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Open a new connection.
    ///
    /// The open is bounded by the command timeout and aborted when `cancel`
    /// fires; nothing is left open on either path.
    pub async fn create_connection(&self, cancel: &CancellationToken) -> DbResult<SqliteConnection> {
        let session_id = Uuid::new_v4();
        let session = self.open_session(self.command_timeout, cancel).await?;
        let guard = SessionGuard::new(Arc::clone(&self.open_sessions));

        debug!(
            session_id = %session_id,
            timeout_secs = self.command_timeout.as_secs(),
            "Opened SQLite connection"
        );

        Ok(SqliteConnection::new(
            session,
            CommandContext::new(self.command_timeout, self.coercions, session_id).with_guard(guard),
        ))
    }

    /// Open a raw driver session outside the counted connection lifecycle.
    pub(crate) async fn open_session(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DbResult<sqlx::SqliteConnection> {
        bounded("connection open", timeout, Some(cancel), async {
            sqlx::SqliteConnection::connect_with(&self.connect_options)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Failed to open SQLite connection");
                    DbError::connection(format!("Failed to connect: {}", e), connection_suggestion(&e))
                })
        })
        .await
    }
}

impl fmt::Debug for SqliteConnectionFactory {
    // Never print the connect options: they carry the database location.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnectionFactory")
            .field("command_timeout", &self.command_timeout)
            .field("coercions", &self.coercions)
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

/// Generate a helpful suggestion from a connection error.
fn connection_suggestion(error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("unable to open") || error_str.contains("no such file") {
        return "Check that the directory exists, or use Mode=ReadWriteCreate (sqlite:...?mode=rwc) to create the file"
            .to_string();
    }

    if error_str.contains("readonly") || error_str.contains("permission") {
        return "Check file permissions on the database and its directory".to_string();
    }

    if error_str.contains("locked") || error_str.contains("busy") {
        return "Another process holds a lock on the database; retry later".to_string();
    }

    "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite".to_string()
}
