//! Integration tests for the connection query surface.
//!
//! Tests verify that:
//! - Each operation honors its row-count semantics
//! - Named parameters bind by name, including reuse
//! - Transactions commit, roll back, and roll back on drop
//! - Timeouts and cancellation abort the session and leak nothing
//! - Close is idempotent and always releases the session

use sqlite_persistence::db::{SqlExecutor, SqliteConnection, SqliteConnectionFactory};
use sqlite_persistence::error::DbError;
use sqlite_persistence::models::{Command, ConnectionOptions, QueryParam};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

// Runs for many seconds on any machine
const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000000) \
     SELECT count(*) FROM c";

#[derive(Debug, sqlx::FromRow, PartialEq)]
struct User {
    id: i64,
    name: String,
    age: Option<i64>,
}

/// Create a file-backed factory and a connection with a seeded users table.
async fn setup(command_timeout_secs: u64) -> (TempDir, SqliteConnectionFactory, SqliteConnection) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let options = ConnectionOptions::new(format!("sqlite:{}?mode=rwc", path.display()))
        .with_command_timeout(command_timeout_secs);
    let factory = SqliteConnectionFactory::new(options).unwrap();
    let mut conn = factory
        .create_connection(&CancellationToken::new())
        .await
        .unwrap();

    conn.execute(&Command::new(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)",
    ))
    .await
    .unwrap();
    for (name, age) in [("Ada", Some(36_i64)), ("Grace", Some(45)), ("Linus", None)] {
        conn.execute(
            &Command::new("INSERT INTO users (name, age) VALUES (:name, :age)")
                .bind("name", name)
                .bind("age", age),
        )
        .await
        .unwrap();
    }
    (dir, factory, conn)
}

#[tokio::test]
async fn test_query_single_or_default() {
    let (_dir, _factory, mut conn) = setup(30).await;

    let one: Option<User> = conn
        .query_single_or_default(&Command::new("SELECT * FROM users WHERE id = :id").bind("id", 1))
        .await
        .unwrap();
    assert_eq!(
        one,
        Some(User {
            id: 1,
            name: "Ada".to_string(),
            age: Some(36)
        })
    );

    let none: Option<User> = conn
        .query_single_or_default(&Command::new("SELECT * FROM users WHERE id = :id").bind("id", 99))
        .await
        .unwrap();
    assert!(none.is_none());

    let many = conn
        .query_single_or_default::<User>(&Command::new("SELECT * FROM users"))
        .await;
    match many {
        Err(DbError::Database { message, .. }) => assert!(message.contains("more than one row")),
        other => panic!("expected database error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_query_first_or_default_and_query() {
    let (_dir, _factory, mut conn) = setup(30).await;

    let first: Option<(String,)> = conn
        .query_first_or_default(&Command::new("SELECT name FROM users ORDER BY id DESC"))
        .await
        .unwrap();
    assert_eq!(first, Some(("Linus".to_string(),)));

    let empty: Option<(String,)> = conn
        .query_first_or_default(&Command::new("SELECT name FROM users WHERE 0"))
        .await
        .unwrap();
    assert!(empty.is_none());

    let all: Vec<User> = conn
        .query(&Command::new("SELECT * FROM users ORDER BY id"))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].age, None);
}

#[tokio::test]
async fn test_execute_scalar() {
    let (_dir, _factory, mut conn) = setup(30).await;

    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));

    let null_age: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT age FROM users WHERE name = :n").bind("n", "Linus"))
        .await
        .unwrap();
    assert_eq!(null_age, None);

    let no_row: Option<String> = conn
        .execute_scalar(&Command::new("SELECT name FROM users WHERE id = -1"))
        .await
        .unwrap();
    assert_eq!(no_row, None);
}

#[tokio::test]
async fn test_execute_returns_affected_rows() {
    let (_dir, _factory, mut conn) = setup(30).await;
    let affected = conn
        .execute(&Command::new("UPDATE users SET age = coalesce(age, 0) + 1"))
        .await
        .unwrap();
    assert_eq!(affected, 3);
}

#[tokio::test]
async fn test_named_parameter_reuse_and_sigils() {
    let (_dir, _factory, mut conn) = setup(30).await;
    let command = Command::new("SELECT count(*) FROM users WHERE age > :min OR (@min = 0 AND age IS NULL) OR name = $name")
        .bind("min", 40)
        .bind("@name", "Ada");
    let count: Option<i64> = conn.execute_scalar(&command).await.unwrap();
    assert_eq!(count, Some(2));

    let literal: Option<String> = conn
        .execute_scalar(&Command::new("SELECT ':min' WHERE :min = 1").bind("min", QueryParam::Int(1)))
        .await
        .unwrap();
    assert_eq!(literal.as_deref(), Some(":min"));
}

#[tokio::test]
async fn test_missing_parameter_is_invalid_input() {
    let (_dir, _factory, mut conn) = setup(30).await;
    let result = conn
        .execute(&Command::new("DELETE FROM users WHERE id = :id"))
        .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    // Nothing ran
    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
}

#[tokio::test]
async fn test_positional_placeholder_is_invalid_input() {
    let (_dir, _factory, mut conn) = setup(30).await;

    let mixed = conn
        .query_single_or_default::<(Option<i64>, i64)>(&Command::new("SELECT ?, :a").bind("a", 5))
        .await;
    match mixed {
        Err(DbError::InvalidInput { message }) => assert!(message.contains("'?'")),
        other => panic!("expected invalid input, got {:?}", other),
    }

    let numbered = conn
        .execute(&Command::new("DELETE FROM users WHERE id = ?1").bind("1", 1))
        .await;
    assert!(matches!(numbered, Err(DbError::InvalidInput { .. })));

    // Rejected before running, and a literal question mark is still fine
    assert!(conn.is_open());
    let literal: Option<String> = conn
        .execute_scalar(&Command::new("SELECT '?' || :suffix").bind("suffix", "!"))
        .await
        .unwrap();
    assert_eq!(literal.as_deref(), Some("?!"));
    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
}

#[tokio::test]
async fn test_sql_errors_keep_connection_usable() {
    let (_dir, _factory, mut conn) = setup(30).await;

    let syntax = conn.execute(&Command::new("SELEC 1")).await;
    match syntax {
        Err(DbError::Database { message, .. }) => assert!(message.contains("syntax")),
        other => panic!("expected database error, got {:?}", other),
    }

    let constraint = conn
        .execute(&Command::new("INSERT INTO users (id, name) VALUES (1, 'dup')"))
        .await;
    match constraint {
        Err(DbError::Database { sql_state, .. }) => assert!(sql_state.is_some()),
        other => panic!("expected constraint error, got {:?}", other),
    }

    assert!(conn.is_open());
    assert_ok!(conn.execute(&Command::new("SELECT 1")).await);
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let (_dir, _factory, mut conn) = setup(30).await;
    let cancel = CancellationToken::new();

    let mut tx = conn.begin_transaction(&cancel).await.unwrap();
    tx.execute(&Command::new("INSERT INTO users (name) VALUES ('Barbara')"))
        .await
        .unwrap();
    let inside: Option<i64> = tx
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(inside, Some(4));
    tx.rollback().await.unwrap();

    let mut tx = conn.begin_transaction(&cancel).await.unwrap();
    tx.execute(&Command::new("INSERT INTO users (name) VALUES ('Edsger')"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let names: Vec<(String,)> = conn
        .query(&Command::new("SELECT name FROM users ORDER BY id"))
        .await
        .unwrap();
    let names: Vec<String> = names.into_iter().map(|(n,)| n).collect();
    assert_eq!(names, vec!["Ada", "Grace", "Linus", "Edsger"]);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let (_dir, _factory, mut conn) = setup(30).await;
    {
        let mut tx = conn.begin_transaction(&CancellationToken::new()).await.unwrap();
        tx.execute(&Command::new("DELETE FROM users")).await.unwrap();
    }
    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases() {
    let (_dir, factory, mut conn) = setup(30).await;
    assert_eq!(factory.open_connections(), 1);

    assert_ok!(conn.close().await);
    assert_ok!(conn.close().await);
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);

    let after = conn.execute(&Command::new("SELECT 1")).await;
    match after {
        Err(DbError::Connection { message, .. }) => assert_eq!(message, "Connection is closed"),
        other => panic!("expected closed connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_aborts_session() {
    let (_dir, factory, mut conn) = setup(1).await;
    assert_eq!(conn.command_timeout(), Duration::from_secs(1));

    let result = conn.execute_scalar::<i64>(&Command::new(SLOW_QUERY)).await;
    match result {
        Err(DbError::Timeout { elapsed_secs, .. }) => assert_eq!(elapsed_secs, 1),
        other => panic!("expected timeout, got {:?}", other),
    }

    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
    assert_err!(conn.execute(&Command::new("SELECT 1")).await);
}

#[tokio::test]
async fn test_precancelled_command_never_runs() {
    let (_dir, factory, mut conn) = setup(30).await;
    let token = CancellationToken::new();
    token.cancel();

    let result = conn
        .execute(&Command::new("DELETE FROM users").cancel_on(token))
        .await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    assert_eq!(factory.open_connections(), 0);

    let mut fresh = factory
        .create_connection(&CancellationToken::new())
        .await
        .unwrap();
    let count: Option<i64> = fresh
        .execute_scalar(&Command::new("SELECT count(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_in_flight_query() {
    let (_dir, factory, mut conn) = setup(30).await;
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = conn
        .execute_scalar::<i64>(&Command::new(SLOW_QUERY).cancel_on(token))
        .await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
}

#[tokio::test]
async fn test_interrupted_transaction_aborts_connection() {
    let (_dir, factory, mut conn) = setup(1).await;
    {
        let mut tx = conn.begin_transaction(&CancellationToken::new()).await.unwrap();
        tx.execute(&Command::new("DELETE FROM users")).await.unwrap();
        let result = tx.execute_scalar::<i64>(&Command::new(SLOW_QUERY)).await;
        assert!(matches!(result, Err(DbError::Timeout { .. })));
        // Released while the transaction still borrows the connection
        assert_eq!(factory.open_connections(), 0);
        assert_err!(tx.execute(&Command::new("SELECT 1")).await);
    }
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
    assert_err!(conn.execute(&Command::new("SELECT 1")).await);
    assert_eq!(factory.open_connections(), 0);
}

#[tokio::test]
async fn test_cancelled_begin_transaction_releases_handle() {
    let (_dir, factory, mut conn) = setup(30).await;
    let token = CancellationToken::new();
    token.cancel();

    let result = conn.begin_transaction(&token).await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    drop(result);
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
}
