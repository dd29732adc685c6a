use datafusion::execution::config::SessionConfig;
use datafusion::execution::context::SessionContext;
use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ObjectStorageConfig;
use crate::error::DataAccessError;

/// Scratch table name a pooled session may have registered during a
/// query; it is cleared on release.
const SCRATCH_TABLE: &str = "base";

/// Process-wide analytical engine plus a bounded pool of configured
/// sessions. The engine (runtime environment and object store client)
/// is built once at startup; sessions are cheap and reused.
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runtime: Arc<RuntimeEnv>,
    store: Arc<dyn ObjectStore>,
    store_url: Url,
    idle: Mutex<Vec<SessionContext>>,
    permits: Arc<Semaphore>,
    max_idle: usize,
}

impl EnginePool {
    /// Builds the engine and the storage client. Failure here is fatal
    /// to startup; there is no degraded mode without a query engine.
    pub fn new(storage: &ObjectStorageConfig, pool_size: usize) -> Result<Self, DataAccessError> {
        info!(
            bucket = %storage.bucket,
            endpoint = %storage.endpoint,
            pool_size,
            "Initializing query engine"
        );

        let max_memory = 8 * 1024 * 1024 * 1024;
        let memory_fraction = 0.8;
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(max_memory, memory_fraction)
            .build()
            .map_err(|e| DataAccessError::ConfigError {
                message: format!("Failed to build query engine runtime: {}", e),
            })?;

        let store: Arc<dyn ObjectStore> = Arc::new(
            AmazonS3Builder::new()
                .with_bucket_name(&storage.bucket)
                .with_endpoint(&storage.endpoint)
                .with_access_key_id(&storage.access_key)
                .with_secret_access_key(&storage.secret_key)
                .with_allow_http(storage.allow_http)
                .with_virtual_hosted_style_request(false)
                .build()
                .map_err(|e| DataAccessError::ConfigError {
                    message: format!("Failed to create object storage client: {}", e),
                })?,
        );

        let store_url = Url::parse(&format!("s3://{}", storage.bucket)).map_err(|e| {
            DataAccessError::ConfigError {
                message: format!("Invalid bucket name {:?}: {}", storage.bucket, e),
            }
        })?;

        let runtime = Arc::new(runtime);
        runtime.register_object_store(&store_url, store.clone());

        info!("Query engine initialized");

        Ok(Self {
            inner: Arc::new(PoolInner {
                runtime,
                store,
                store_url,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(pool_size)),
                max_idle: pool_size,
            }),
        })
    }

    /// Object store client shared with the rest of the service (uploads,
    /// deletes).
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.inner.store.clone()
    }

    /// Base URL of the dataset bucket, e.g. `s3://datasets`.
    pub fn bucket_url(&self) -> &Url {
        &self.inner.store_url
    }

    /// Returns a pooled session, creating one when the pool is empty.
    /// Blocks when all permits are handed out, so engine concurrency is
    /// bounded. Storage credentials are re-applied on every handout;
    /// session-level configuration is not guaranteed to survive reuse.
    pub async fn acquire(&self) -> Result<PooledConnection, DataAccessError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DataAccessError::InternalError {
                message: "Connection pool is shut down".to_string(),
            })?;

        let reused = self.inner.idle.lock().expect("pool lock poisoned").pop();
        let ctx = match reused {
            Some(ctx) => {
                debug!("Reusing pooled engine session");
                ctx
            }
            None => self.inner.new_session(),
        };

        ctx.register_object_store(&self.inner.store_url, self.inner.store.clone());

        Ok(PooledConnection {
            ctx: Some(ctx),
            _permit: permit,
            pool: self.inner.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.inner.idle.lock().expect("pool lock poisoned").len()
    }
}

impl PoolInner {
    fn new_session(&self) -> SessionContext {
        let config = SessionConfig::new();
        SessionContext::new_with_config_rt(config, self.runtime.clone()).enable_url_table()
    }

    fn release(&self, ctx: SessionContext) {
        // Lightweight session reset before pooling; a failed reset means
        // the session state is suspect and the connection is closed.
        if let Err(e) = ctx.deregister_table(SCRATCH_TABLE) {
            warn!("Session reset failed, closing connection: {}", e);
            return;
        }

        let mut idle = self.idle.lock().expect("pool lock poisoned");
        if idle.len() < self.max_idle {
            idle.push(ctx);
        }
        // Overflow connections are simply dropped (closed).
    }
}

/// RAII handle to a pooled session. Dropping it releases the session
/// back to the pool exactly once, on every exit path.
pub struct PooledConnection {
    ctx: Option<SessionContext>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn ctx(&self) -> &SessionContext {
        self.ctx.as_ref().expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_pool(size: usize) -> EnginePool {
        let storage = ObjectStorageConfig {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "datasets".to_string(),
            access_key: "admin".to_string(),
            secret_key: "admin123".to_string(),
            allow_http: true,
        };
        EnginePool::new(&storage, size).expect("pool should build")
    }

    #[tokio::test]
    async fn released_connection_returns_to_the_idle_pool() {
        let pool = test_pool(2);
        assert_eq!(pool.idle_len(), 0);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_len(), 1);

        // Re-acquire drains the idle list instead of growing it.
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        drop(conn);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_until_a_connection_is_released() {
        let pool = test_pool(1);
        let held = pool.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire should block while exhausted");

        drop(held);
        let conn = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .expect("acquire should proceed after release")
            .unwrap();
        drop(conn);
    }

    #[tokio::test]
    async fn sessions_can_run_engine_queries() {
        let pool = test_pool(1);
        let conn = pool.acquire().await.unwrap();
        let df = conn.ctx().sql("SELECT 1 AS health_check").await.unwrap();
        let batches = df.collect().await.unwrap();
        assert_eq!(batches[0].num_rows(), 1);
    }
}
