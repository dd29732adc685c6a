use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use data_access_service::catalog::{ParamSpec, ParamType};
use data_access_service::config::ObjectStorageConfig;
use data_access_service::exec;
use data_access_service::params::apply_params;
use data_access_service::pool::EnginePool;
use data_access_service::views::build_view_query;

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn test_storage_config() -> ObjectStorageConfig {
    ObjectStorageConfig {
        endpoint: "http://localhost:9000".to_string(),
        bucket: "datasets-test".to_string(),
        access_key: "admin".to_string(),
        secret_key: "admin123".to_string(),
        allow_http: true,
    }
}

fn write_people_csv(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("people.csv");
    let mut writer = csv::Writer::from_path(&path).expect("Failed to create csv");
    writer.write_record(["id", "name", "age"]).unwrap();
    writer.write_record(["1", "ana", "30"]).unwrap();
    writer.write_record(["2", "bob", "20"]).unwrap();
    writer.write_record(["3", "carlos", "40"]).unwrap();
    writer.flush().unwrap();
    path.to_str().unwrap().to_string()
}

fn age_param() -> ParamSpec {
    ParamSpec {
        name: "age".to_string(),
        param_type: ParamType::Numeric,
        required: true,
        default: None,
        min: Some(0.0),
        max: Some(150.0),
        one_of: None,
    }
}

#[tokio::test]
async fn test_buffered_query_over_a_parameterized_view() {
    init_test_logging();

    // Given: a local dataset file and a view over it with a numeric
    // parameter
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_url = write_people_csv(&dir);
    let pool = Arc::new(EnginePool::new(&test_storage_config(), 2).expect("Failed to build pool"));

    let query = build_view_query(&data_url, "SELECT id, name, age FROM base WHERE age > $age ORDER BY id")
        .expect("Failed to build view query");

    // When: executing with age=25 bound through the declared contract
    let mut raw = HashMap::new();
    raw.insert("age".to_string(), "25".to_string());
    let bound = apply_params(&raw, &[age_param()]).expect("Failed to bind params");

    let conn = pool.acquire().await.expect("Failed to acquire connection");
    let rows = exec::run_buffered(conn, &query, bound)
        .await
        .expect("Query failed");

    // Then: only the matching rows come back, in order
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "ana");
    assert_eq!(rows[1]["name"], "carlos");
    assert_eq!(rows[0]["age"], 30);
}

#[tokio::test]
async fn test_streamed_query_yields_ndjson_and_releases_the_connection() {
    init_test_logging();

    // Given: a pool with a single session so release is observable
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_url = write_people_csv(&dir);
    let pool = Arc::new(EnginePool::new(&test_storage_config(), 1).expect("Failed to build pool"));

    let query = build_view_query(&data_url, "SELECT name FROM base WHERE age > $age ORDER BY id")
        .expect("Failed to build view query");
    let mut raw = HashMap::new();
    raw.insert("age".to_string(), "25".to_string());
    let bound = apply_params(&raw, &[age_param()]).expect("Failed to bind params");

    // When: draining the stream
    let conn = pool.acquire().await.expect("Failed to acquire connection");
    let mut stream = exec::run_streamed(conn, &query, bound)
        .await
        .expect("Failed to open stream");

    let mut lines = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.expect("Stream chunk failed");
        let text = String::from_utf8(chunk.to_vec()).expect("Chunk is not utf8");
        assert!(text.ends_with('\n'));
        let row: serde_json::Value =
            serde_json::from_str(text.trim_end()).expect("Line is not valid json");
        lines.push(row);
    }
    drop(stream);

    // Then: one json object per row
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["name"], "ana");
    assert_eq!(lines[1]["name"], "carlos");

    // And: the single session is back in the pool
    let reacquired = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("Pool did not release the session")
        .expect("Failed to re-acquire connection");
    drop(reacquired);
}

#[tokio::test]
async fn test_querying_an_unmaterialized_dataset_is_an_engine_error() {
    init_test_logging();

    // Given: a well-formed view whose backing object does not exist yet
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("not-written-yet.parquet");
    let pool = Arc::new(EnginePool::new(&test_storage_config(), 1).expect("Failed to build pool"));

    let query = build_view_query(missing.to_str().unwrap(), "SELECT * FROM base")
        .expect("Failed to build view query");

    // When: executing it
    let conn = pool.acquire().await.expect("Failed to acquire connection");
    let err = exec::run_buffered(conn, &query, Vec::new())
        .await
        .expect_err("Query over a missing object should fail");

    // Then: the failure is an upstream engine condition, not a request
    // validation error
    assert_eq!(err.kind(), "EngineError");
    assert_eq!(err.status_code().as_u16(), 502);
}

#[tokio::test]
async fn test_dropping_a_stream_midway_still_releases_the_connection() {
    init_test_logging();

    // Given: a single-session pool and an open stream
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_url = write_people_csv(&dir);
    let pool = Arc::new(EnginePool::new(&test_storage_config(), 1).expect("Failed to build pool"));

    let query = build_view_query(&data_url, "SELECT * FROM base").expect("Failed to build query");
    let conn = pool.acquire().await.expect("Failed to acquire connection");
    let stream = exec::run_streamed(conn, &query, Vec::new())
        .await
        .expect("Failed to open stream");

    // When: the consumer disconnects without reading a single line
    drop(stream);

    // Then: the session returns to the pool
    let reacquired = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("Pool did not release the session")
        .expect("Failed to re-acquire connection");
    drop(reacquired);
}
