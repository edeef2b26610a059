//! Integration tests for queue DDL: create, list, drop.
//!
//! Requires Docker (testcontainers) unless `MULE_TEST_PG_URL` points at a
//! running PostgreSQL instance.

use mule_store::queries::queues;

/// Table prefixes making up one queue's group.
const PREFIXES: [&str; 5] = ["t", "r", "c", "e", "w"];

async fn queue_tables_present(pool: &sqlx::PgPool, queue: &str) -> Vec<String> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'mule' AND tablename LIKE '%\\_' || $1 \
         ORDER BY tablename",
    )
    .bind(queue)
    .fetch_all(pool)
    .await
    .expect("pg_tables query");
    rows.into_iter().map(|(name,)| name).collect()
}

#[tokio::test]
async fn create_queue_makes_all_five_tables() {
    let db = mule_test_utils::TestDb::create().await;

    queues::create_queue(&db.pool, "jobs").await.expect("create");

    let tables = queue_tables_present(&db.pool, "jobs").await;
    for prefix in PREFIXES {
        assert!(
            tables.contains(&format!("{prefix}_jobs")),
            "missing {prefix}_jobs in {tables:?}"
        );
    }

    db.teardown().await;
}

#[tokio::test]
async fn create_queue_is_idempotent() {
    let db = mule_test_utils::TestDb::create().await;

    queues::create_queue(&db.pool, "jobs").await.expect("create");
    queues::create_queue(&db.pool, "jobs").await.expect("create again");

    assert_eq!(queues::list_queues(&db.pool).await.expect("list"), vec!["jobs"]);

    db.teardown().await;
}

#[tokio::test]
async fn drop_queue_removes_the_group_and_tolerates_missing() {
    let db = mule_test_utils::TestDb::create().await;

    queues::create_queue(&db.pool, "jobs").await.expect("create");
    queues::drop_queue(&db.pool, "jobs").await.expect("drop");

    assert!(queue_tables_present(&db.pool, "jobs").await.is_empty());
    assert!(queues::list_queues(&db.pool).await.expect("list").is_empty());

    // Dropping again (or a queue that never existed) is fine.
    queues::drop_queue(&db.pool, "jobs").await.expect("drop again");
    queues::drop_queue(&db.pool, "never_was").await.expect("drop missing");

    db.teardown().await;
}

#[tokio::test]
async fn list_queues_sorts_by_name() {
    let db = mule_test_utils::TestDb::create().await;

    queues::create_queue(&db.pool, "zeta").await.expect("create");
    queues::create_queue(&db.pool, "alpha").await.expect("create");
    queues::create_queue(&db.pool, "mid").await.expect("create");

    assert_eq!(
        queues::list_queues(&db.pool).await.expect("list"),
        vec!["alpha", "mid", "zeta"]
    );

    db.teardown().await;
}

#[tokio::test]
async fn invalid_queue_names_are_rejected_before_sql() {
    let db = mule_test_utils::TestDb::create().await;

    let err = queues::create_queue(&db.pool, "jobs; DROP TABLE x")
        .await
        .expect_err("injection attempt must fail validation");
    assert!(err.to_string().contains("queue name"));

    db.teardown().await;
}
