//! Integration tests for the multi-result cursor.

use sqlite_persistence::db::{SqlExecutor, SqliteConnection, SqliteConnectionFactory};
use sqlite_persistence::error::DbError;
use sqlite_persistence::models::{Command, ConnectionOptions};
use tokio_util::sync::CancellationToken;

async fn seeded_connection() -> (SqliteConnectionFactory, SqliteConnection) {
    let factory = SqliteConnectionFactory::new(ConnectionOptions::new(":memory:")).unwrap();
    let mut conn = factory
        .create_connection(&CancellationToken::new())
        .await
        .unwrap();
    conn.execute(&Command::new(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL);
         INSERT INTO items (label) VALUES ('alpha'), ('beta'), ('gamma');",
    ))
    .await
    .unwrap();
    (factory, conn)
}

#[tokio::test]
async fn test_reads_sets_in_order() {
    let (_factory, mut conn) = seeded_connection().await;
    let command = Command::new(
        "SELECT 1 AS marker;
         SELECT label FROM items ORDER BY id;
         SELECT count(*) FROM items WHERE id > :min;",
    )
    .bind("min", 1);

    let mut cursor = conn.query_multiple(&command).await.unwrap();
    assert!(!cursor.is_consumed());

    let marker: Option<(i64,)> = cursor.read_single_or_default().await.unwrap();
    assert_eq!(marker, Some((1,)));

    let labels: Vec<(String,)> = cursor.read().await.unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels[0].0, "alpha");
    assert!(!cursor.is_consumed());

    let count: Option<(i64,)> = cursor.read_first_or_default().await.unwrap();
    assert_eq!(count, Some((2,)));
    assert!(cursor.is_consumed());
    assert_eq!(cursor.result_sets_read(), 3);

    match cursor.read::<(i64,)>().await {
        Err(DbError::CursorConsumed { result_sets }) => assert_eq!(result_sets, 3),
        other => panic!("expected consumed cursor, got {:?}", other),
    }
}

#[tokio::test]
async fn test_statement_without_rows_is_empty_set() {
    let (_factory, mut conn) = seeded_connection().await;
    let command = Command::new(
        "UPDATE items SET label = upper(label) WHERE id = 1;
         SELECT label FROM items WHERE id = 1;",
    );

    let mut cursor = conn.query_multiple(&command).await.unwrap();
    let updated: Vec<(String,)> = cursor.read().await.unwrap();
    assert!(updated.is_empty());
    let label: Option<(String,)> = cursor.read_single_or_default().await.unwrap();
    assert_eq!(label, Some(("ALPHA".to_string(),)));
    assert!(cursor.is_consumed());
}

#[tokio::test]
async fn test_single_read_rejects_many_rows() {
    let (_factory, mut conn) = seeded_connection().await;
    let command = Command::new("SELECT label FROM items");
    let mut cursor = conn.query_multiple(&command).await.unwrap();
    let result = cursor.read_single_or_default::<(String,)>().await;
    assert!(matches!(result, Err(DbError::Database { .. })));
}

#[tokio::test]
async fn test_failing_statement_poisons_cursor() {
    let (_factory, mut conn) = seeded_connection().await;
    let command = Command::new("SELECT 1; SELECT * FROM missing_table;");

    let mut cursor = match conn.query_multiple(&command).await {
        Ok(cursor) => cursor,
        // Some SQLite builds reject the batch before the first set
        Err(e) => {
            assert!(matches!(e, DbError::Database { .. }));
            return;
        }
    };
    let err = match cursor.read::<(i64,)>().await {
        Ok(_) => cursor.read::<(i64,)>().await.unwrap_err(),
        Err(e) => e,
    };
    assert!(matches!(err, DbError::Database { .. }));
    assert!(cursor.is_consumed());
    assert!(matches!(
        cursor.read::<(i64,)>().await,
        Err(DbError::CursorConsumed { .. })
    ));
}

#[tokio::test]
async fn test_connection_usable_after_partial_read() {
    let (factory, mut conn) = seeded_connection().await;
    {
        let command = Command::new("SELECT 1; SELECT 2; SELECT 3;");
        let mut cursor = conn.query_multiple(&command).await.unwrap();
        let first: Option<(i64,)> = cursor.read_first_or_default().await.unwrap();
        assert_eq!(first, Some((1,)));
    }
    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM items"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
    conn.close().await.unwrap();
    assert_eq!(factory.open_connections(), 0);
}

#[tokio::test]
async fn test_multiple_inside_transaction() {
    let (_factory, mut conn) = seeded_connection().await;
    let mut tx = conn
        .begin_transaction(&CancellationToken::new())
        .await
        .unwrap();
    {
        let command = Command::new(
            "INSERT INTO items (label) VALUES (:label);
             SELECT count(*) FROM items;",
        )
        .bind("label", "delta");
        let mut cursor = tx.query_multiple(&command).await.unwrap();
        let inserted: Vec<(i64,)> = cursor.read().await.unwrap();
        assert!(inserted.is_empty());
        let count: Option<(i64,)> = cursor.read_single_or_default().await.unwrap();
        assert_eq!(count, Some((4,)));
    }
    tx.rollback().await.unwrap();

    let count: Option<i64> = conn
        .execute_scalar(&Command::new("SELECT count(*) FROM items"))
        .await
        .unwrap();
    assert_eq!(count, Some(3));
}

#[tokio::test]
async fn test_cancelled_cursor_aborts_connection() {
    let (factory, mut conn) = seeded_connection().await;
    let token = CancellationToken::new();
    token.cancel();
    let command = Command::new("SELECT 1; SELECT 2;").cancel_on(token);
    let result = conn.query_multiple(&command).await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    drop(result);

    // Released by the failed call itself, before the connection is touched again
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
    assert!(conn.execute(&Command::new("SELECT 1")).await.is_err());
    assert_eq!(factory.open_connections(), 0);
}

#[tokio::test]
async fn test_timed_out_cursor_read_releases_handle_while_borrowed() {
    let factory = SqliteConnectionFactory::new(ConnectionOptions::new(":memory:").with_command_timeout(1))
        .unwrap();
    let mut conn = factory
        .create_connection(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(factory.open_connections(), 1);

    let command = Command::new(
        "SELECT 1;
         WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000000)
         SELECT count(*) FROM c;",
    );
    let error = match conn.query_multiple(&command).await {
        Err(e) => e,
        Ok(mut cursor) => {
            let error = match cursor.read_first_or_default::<(i64,)>().await {
                Err(e) => e,
                Ok(_) => cursor.read::<(i64,)>().await.unwrap_err(),
            };
            assert!(cursor.is_consumed());
            // The cursor still borrows the connection here
            assert_eq!(factory.open_connections(), 0);
            error
        }
    };
    assert!(matches!(error, DbError::Timeout { .. }));
    assert!(!conn.is_open());
    assert_eq!(factory.open_connections(), 0);
}
