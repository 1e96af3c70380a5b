use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use strata_data::{Aggregate, DataService, EntityPolicy, FindOptions, OrderDirection, ServiceConfig};
use strata_db::{DbPool, PoolConfig};
use strata_types::{from_record, DataError, DbErrorKind, Record};

const SCHEMA: &str = "-- migrate:up
CREATE TABLE users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT,
    age INTEGER,
    deleted_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- migrate:down
DROP TABLE users;
";

fn rec(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

async fn service() -> (tempfile::TempDir, DataService) {
    let dir = tempfile::tempdir().expect("tempdir");
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).expect("migrations dir");
    fs::write(migrations.join("20240101000000_users.sql"), SCHEMA).expect("schema migration");

    let service = DataService::initialize(ServiceConfig {
        database: PoolConfig {
            max_connections: 4,
            health_check_interval_ms: 0,
            ..PoolConfig::for_path(dir.path().join("data.db").to_string_lossy())
        },
        migrations_path: migrations,
        run_migrations_on_startup: true,
        ..ServiceConfig::default()
    })
    .await
    .expect("service should start");
    (dir, service)
}

async fn seed(service: &DataService) {
    let rows = vec![
        rec(json!({"id": "u1", "email": "ada@example.com", "name": "Ada", "age": 36})),
        rec(json!({"id": "u2", "email": "grace@example.com", "name": "Grace", "age": 45})),
        rec(json!({"id": "u3", "email": "linus@example.com", "name": "Linus", "age": 21, "deleted_at": "2024-01-01"})),
    ];
    service.create_many("users", rows).await.expect("seed rows");
}

#[tokio::test]
async fn create_then_find_by_id_round_trips() {
    let (_dir, service) = service().await;

    let created = service
        .create("users", rec(json!({"email": "ada@example.com", "name": "Ada", "age": 36})))
        .await
        .expect("create");

    let id = created["id"].as_str().expect("generated id").to_string();
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "id should be a UUID: {id}");
    assert!(created["created_at"].is_string(), "server defaults are returned");

    let found = service
        .find_by_id("users", id.clone())
        .await
        .expect("find_by_id")
        .expect("row exists");
    assert_eq!(found, created);

    #[derive(Debug, Deserialize)]
    struct User {
        id: String,
        email: String,
        age: Option<i64>,
    }
    let user: User = from_record(found).expect("projection");
    assert_eq!(user.id, id);
    assert_eq!(user.email, "ada@example.com");
    assert_eq!(user.age, Some(36));
}

#[tokio::test]
async fn find_filters_orders_and_pages() {
    let (_dir, service) = service().await;
    seed(&service).await;

    let active = service
        .find(
            "users",
            rec(json!({"deleted_at": null})),
            FindOptions::default().order_by("age", OrderDirection::Desc),
        )
        .await
        .expect("find");
    let names: Vec<&str> = active.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["Grace", "Ada"]);

    let page = service
        .find(
            "users",
            Record::new(),
            FindOptions::default()
                .order_by("age", OrderDirection::Asc)
                .select(["id"])
                .limit(1)
                .offset(1),
        )
        .await
        .expect("paged find");
    assert_eq!(page, vec![rec(json!({"id": "u1"}))]);

    let none = service
        .find("users", rec(json!({"email": "nobody@example.com"})), FindOptions::default())
        .await
        .expect("empty find");
    assert!(none.is_empty());

    let hostile = service
        .find_one("users", rec(json!({"email": "' OR '1'='1"})))
        .await
        .expect("hostile value is just a value");
    assert!(hostile.is_none());
}

#[tokio::test]
async fn count_exists_and_aggregates() {
    let (_dir, service) = service().await;

    assert_eq!(
        service
            .aggregate("users", Aggregate::Max, "age", Record::new())
            .await
            .expect("max over empty set"),
        Value::Null
    );

    seed(&service).await;

    assert_eq!(service.count("users", Record::new()).await.expect("count"), 3);
    assert_eq!(
        service.count("users", rec(json!({"deleted_at": null}))).await.expect("count"),
        2
    );
    assert!(service.exists("users", rec(json!({"name": "Ada"}))).await.expect("exists"));
    assert!(!service.exists("users", rec(json!({"name": "Bob"}))).await.expect("exists"));

    let sum = service
        .aggregate("users", Aggregate::Sum, "age", Record::new())
        .await
        .expect("sum");
    assert_eq!(sum, json!(102));
    let avg = service
        .aggregate("users", Aggregate::Avg, "age", rec(json!({"deleted_at": null})))
        .await
        .expect("avg");
    assert_eq!(avg.as_f64(), Some(40.5));
    let min = service
        .aggregate("users", Aggregate::Min, "age", Record::new())
        .await
        .expect("min");
    assert_eq!(min, json!(21));
}

#[tokio::test]
async fn update_and_delete_report_missing_rows() {
    let (_dir, service) = service().await;
    seed(&service).await;

    let updated = service
        .update("users", "u1", rec(json!({"id": "hijack", "name": "Ada Lovelace"})))
        .await
        .expect("update")
        .expect("row exists");
    assert_eq!(updated["id"], json!("u1"));
    assert_eq!(updated["name"], json!("Ada Lovelace"));

    let missing = service
        .update("users", "nope", rec(json!({"name": "Ghost"})))
        .await
        .expect("update of a missing id is not an error");
    assert!(missing.is_none());

    let err = service
        .update("users", "u1", rec(json!({"id": "u9"})))
        .await
        .expect_err("nothing to update");
    assert!(matches!(err, DataError::Validation(_)));

    assert!(service.delete("users", "u2").await.expect("delete"));
    assert!(!service.delete("users", "u2").await.expect("second delete"));
    assert_eq!(service.count("users", Record::new()).await.expect("count"), 2);
}

#[tokio::test]
async fn constraint_violations_are_classified() {
    let (_dir, service) = service().await;
    seed(&service).await;

    let err = service
        .create("users", rec(json!({"email": "ada@example.com"})))
        .await
        .expect_err("duplicate email");
    assert_eq!(err.db_kind(), Some(DbErrorKind::UniqueViolation));

    let err = service
        .create("users", rec(json!({"name": "No Email"})))
        .await
        .expect_err("missing email");
    assert_eq!(err.db_kind(), Some(DbErrorKind::NotNullViolation));

    let err = service
        .create("users", Record::new())
        .await
        .expect_err("empty payload");
    assert!(matches!(err, DataError::Validation(_)));
}

#[tokio::test]
async fn create_many_is_all_or_nothing() {
    let (_dir, service) = service().await;

    let err = service
        .create_many(
            "users",
            vec![
                rec(json!({"email": "a@example.com"})),
                rec(json!({"email": "b@example.com"})),
                rec(json!({"email": "a@example.com"})),
            ],
        )
        .await
        .expect_err("duplicate in batch");
    assert_eq!(err.db_kind(), Some(DbErrorKind::UniqueViolation));
    assert_eq!(service.count("users", Record::new()).await.expect("count"), 0);

    let created = service
        .create_many(
            "users",
            vec![
                rec(json!({"id": "b", "email": "b@example.com"})),
                rec(json!({"id": "a", "email": "a@example.com"})),
            ],
        )
        .await
        .expect("batch");
    let ids: Vec<&str> = created.iter().filter_map(|r| r["id"].as_str()).collect();
    assert_eq!(ids, vec!["b", "a"], "rows come back in input order");
}

#[tokio::test]
async fn bad_identifiers_fail_before_io() {
    // The pool is never initialized, so anything reaching I/O would be
    // ServiceUnavailable instead.
    let service = DataService::new(DbPool::new(), EntityPolicy::allow_all());

    let err = service
        .find("users; DROP TABLE users", Record::new(), FindOptions::default())
        .await
        .expect_err("bad entity");
    assert!(matches!(err, DataError::Validation(_)));

    let err = service
        .find("users", rec(json!({"email = '' OR 1": 1})), FindOptions::default())
        .await
        .expect_err("bad column");
    assert!(matches!(err, DataError::Validation(_)));

    let err = service
        .query("DROP TABLE users", vec![])
        .await
        .expect_err("destructive raw query");
    assert!(matches!(err, DataError::Validation(_)));

    let err = service
        .find("users", Record::new(), FindOptions::default())
        .await
        .expect_err("pool not initialized");
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn allow_list_limits_entities() {
    let (_dir, service) = service().await;
    let restricted = DataService::new(service.pool().clone(), EntityPolicy::only(["posts"]));

    let err = restricted
        .count("users", Record::new())
        .await
        .expect_err("users is not allowed");
    assert!(matches!(err, DataError::Validation(_)));
}

#[tokio::test]
async fn raw_queries_are_guarded_and_admin_queries_are_not() {
    let (_dir, service) = service().await;
    seed(&service).await;

    let result = service
        .query("SELECT name FROM users WHERE age > ?1 ORDER BY age", vec![json!(30)])
        .await
        .expect("safe query");
    assert_eq!(result.row_count, 2);

    for sql in ["DELETE FROM users", "DROP TABLE users", "ALTER TABLE users ADD COLUMN x TEXT"] {
        let err = service.query(sql, vec![]).await.expect_err(sql);
        assert!(matches!(err, DataError::Validation(_)), "{sql}");
    }
    assert_eq!(service.count("users", Record::new()).await.expect("count"), 3);

    let result = service
        .query_admin("DELETE FROM users", vec![])
        .await
        .expect("admin delete");
    assert_eq!(result.row_count, 3);
}

#[tokio::test]
async fn transaction_commits_and_rolls_back() {
    let (_dir, service) = service().await;

    service
        .transaction(|tx| -> Result<(), DataError> {
            tx.create("users", rec(json!({"id": "t1", "email": "t1@example.com"})))?;
            tx.create("users", rec(json!({"id": "t2", "email": "t2@example.com"})))?;
            Ok(())
        })
        .await
        .expect("commit");
    assert_eq!(service.count("users", Record::new()).await.expect("count"), 2);

    let err = service
        .transaction(|tx| -> Result<(), DataError> {
            tx.create("users", rec(json!({"id": "t3", "email": "t3@example.com"})))?;
            tx.create("users", rec(json!({"id": "t4", "email": "t1@example.com"})))?;
            Ok(())
        })
        .await
        .expect_err("duplicate email aborts");
    assert_eq!(err.db_kind(), Some(DbErrorKind::UniqueViolation));
    assert!(service.find_by_id("users", "t3").await.expect("find").is_none());
}

#[tokio::test]
async fn caught_nested_failure_keeps_outer_work() {
    let (_dir, service) = service().await;

    let (inner_failed, inner_depth) = service
        .transaction(|tx| -> Result<(bool, u32), DataError> {
            tx.create("users", rec(json!({"id": "outer", "email": "outer@example.com"})))?;
            let mut depth = 0;
            let nested: Result<(), DataError> = tx.transaction(|inner| {
                depth = inner.depth();
                inner.create("users", rec(json!({"id": "inner", "email": "inner@example.com"})))?;
                Err(DataError::Validation("abandon inner work".to_string()))
            });
            Ok((nested.is_err(), depth))
        })
        .await
        .expect("outer commits");

    assert!(inner_failed);
    assert_eq!(inner_depth, 1);
    assert!(service.find_by_id("users", "outer").await.expect("find").is_some());
    assert!(service.find_by_id("users", "inner").await.expect("find").is_none());
}

#[tokio::test]
async fn propagated_nested_failure_rolls_back_everything() {
    let (_dir, service) = service().await;
    seed(&service).await;

    service
        .transaction(|tx| -> Result<(), DataError> {
            tx.create("users", rec(json!({"id": "outer", "email": "outer@example.com"})))?;
            tx.transaction(|inner| -> Result<(), DataError> {
                inner.update("users", "u1", rec(json!({"name": "Changed"})))?;
                inner.create("users", rec(json!({"email": "ada@example.com"})))?;
                Ok(())
            })?;
            Ok(())
        })
        .await
        .expect_err("nested failure propagates");

    assert!(service.find_by_id("users", "outer").await.expect("find").is_none());
    let ada = service.find_by_id("users", "u1").await.expect("find").expect("u1");
    assert_eq!(ada["name"], json!("Ada"));
}

#[tokio::test]
async fn scope_exposes_reads_and_guarded_queries() {
    let (_dir, service) = service().await;
    seed(&service).await;

    let (count, exists, guarded) = service
        .transaction(|tx| -> Result<(i64, bool, bool), DataError> {
            let count = tx.count("users", &Record::new())?;
            let exists = tx.exists("users", &rec(json!({"id": "u2"})))?;
            let guarded = matches!(tx.query("DELETE FROM users", &[]), Err(DataError::Validation(_)));
            assert!(tx.delete("users", "u2")?);
            Ok((count, exists, guarded))
        })
        .await
        .expect("transaction");

    assert_eq!(count, 3);
    assert!(exists);
    assert!(guarded);
    assert_eq!(service.count("users", Record::new()).await.expect("count"), 2);
}

#[tokio::test]
async fn shutdown_makes_the_service_unavailable() {
    let (_dir, service) = service().await;
    let health = service.health().await;
    assert!(health.healthy);

    assert!(service.shutdown(None).await);
    assert!(!service.shutdown(None).await);

    let err = service.count("users", Record::new()).await.expect_err("shut down");
    assert!(err.is_unavailable());
    assert!(!service.health().await.healthy);
}

#[tokio::test]
async fn failing_startup_migration_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).expect("migrations dir");
    fs::write(
        migrations.join("1_bad.sql"),
        "CREATE TABLE early (id TEXT);\n-- migrate:up\nSELECT 1;\n",
    )
    .expect("malformed migration");

    let err = DataService::initialize(ServiceConfig {
        database: PoolConfig {
            health_check_interval_ms: 0,
            ..PoolConfig::for_path(dir.path().join("data.db").to_string_lossy())
        },
        migrations_path: migrations,
        run_migrations_on_startup: true,
        ..ServiceConfig::default()
    })
    .await;
    assert!(matches!(err, Err(strata_data::StartupError::Migrations(_))));
}
