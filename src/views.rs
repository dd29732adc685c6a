use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::catalog::ParamSpec;
use crate::error::DataAccessError;
use crate::pool::PooledConnection;

/// A compiled view query together with its parameter contract, cached
/// per (tenant, dataset, view). Process-local; entries reflect the view
/// definition at the time of the last population.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    pub query: String,
    pub params: Vec<ParamSpec>,
}

/// Wraps a user fragment with the dataset's parquet read. The fragment
/// sees the dataset as a relation named `base` and must not open with
/// its own data-source clause; that clause is managed internally.
pub fn build_view_query(
    parquet_url: &str,
    user_fragment: &str,
) -> Result<String, DataAccessError> {
    let trimmed = user_fragment.trim();
    if trimmed.is_empty() {
        return Err(DataAccessError::InvalidViewQuery {
            message: "View query must not be empty".to_string(),
        });
    }
    if opens_with_from(trimmed) {
        return Err(DataAccessError::InvalidViewQuery {
            message: "View query must not include a FROM clause at start. It is managed internally."
                .to_string(),
        });
    }

    Ok(format!(
        "WITH base AS (SELECT * FROM '{}') {}",
        parquet_url, trimmed
    ))
}

fn opens_with_from(fragment: &str) -> bool {
    let bytes = fragment.as_bytes();
    if bytes.len() < 4 || !fragment[..4].eq_ignore_ascii_case("from") {
        return false;
    }
    match bytes.get(4) {
        None => true,
        Some(c) => !(c.is_ascii_alphanumeric() || *c == b'_'),
    }
}

/// Compile-validates a built query against the engine's SQL frontend,
/// so a malformed view surfaces at definition time rather than on first
/// use. The parquet object itself is not resolved here; views may be
/// defined before their dataset finishes materializing.
pub fn compile_check(conn: &PooledConnection, query: &str) -> Result<(), DataAccessError> {
    conn.ctx()
        .state()
        .sql_to_statement(query, "generic")
        .map_err(|e| DataAccessError::InvalidViewQuery {
            message: e.to_string(),
        })?;
    Ok(())
}

#[derive(Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<(String, String, String), CachedQuery>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Option<CachedQuery> {
        self.entries
            .read()
            .await
            .get(&key(tenant, dataset_id, view_id))
            .cloned()
    }

    pub async fn insert(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
        cached: CachedQuery,
    ) {
        debug!(tenant, dataset_id, view_id, "Caching view query");
        self.entries
            .write()
            .await
            .insert(key(tenant, dataset_id, view_id), cached);
    }

    pub async fn remove(&self, tenant: &str, dataset_id: &str, view_id: &str) {
        self.entries
            .write()
            .await
            .remove(&key(tenant, dataset_id, view_id));
    }

    /// Drops every cached view of a dataset, e.g. when the dataset is
    /// deleted.
    pub async fn remove_dataset(&self, tenant: &str, dataset_id: &str) {
        self.entries
            .write()
            .await
            .retain(|(t, d, _), _| !(t == tenant && d == dataset_id));
    }
}

fn key(tenant: &str, dataset_id: &str, view_id: &str) -> (String, String, String) {
    (
        tenant.to_string(),
        dataset_id.to_string(),
        view_id.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARQUET: &str = "s3://datasets/acme/sales.parquet";

    #[test]
    fn wraps_fragment_with_parquet_read() {
        let query =
            build_view_query(PARQUET, "SELECT * FROM base WHERE age > $age ORDER BY id").unwrap();
        assert_eq!(
            query,
            "WITH base AS (SELECT * FROM 's3://datasets/acme/sales.parquet') \
             SELECT * FROM base WHERE age > $age ORDER BY id"
        );
    }

    #[test]
    fn rejects_fragment_opening_with_from_case_insensitively() {
        for fragment in [
            "FROM somewhere SELECT *",
            "from somewhere",
            "  From 's3://other/file.parquet'",
            "\tFROM base",
            "FROM",
        ] {
            let err = build_view_query(PARQUET, fragment).unwrap_err();
            assert_eq!(err.kind(), "InvalidDAQuery", "fragment {:?}", fragment);
        }
    }

    #[test]
    fn allows_identifiers_that_merely_start_with_from() {
        let query = build_view_query(PARQUET, "SELECT fromage FROM base").unwrap();
        assert!(query.ends_with("SELECT fromage FROM base"));
    }

    #[test]
    fn rejects_empty_fragment() {
        let err = build_view_query(PARQUET, "   ").unwrap_err();
        assert_eq!(err.kind(), "InvalidDAQuery");
    }

    #[tokio::test]
    async fn cache_is_scoped_per_tenant_dataset_view() {
        let cache = QueryCache::new();
        let entry = CachedQuery {
            query: "SELECT 1".to_string(),
            params: vec![],
        };
        cache.insert("acme", "sales", "by_age", entry.clone()).await;

        assert!(cache.get("acme", "sales", "by_age").await.is_some());
        assert!(cache.get("acme", "sales", "other").await.is_none());
        assert!(cache.get("other", "sales", "by_age").await.is_none());

        cache.remove_dataset("acme", "sales").await;
        assert!(cache.get("acme", "sales", "by_age").await.is_none());
    }
}
