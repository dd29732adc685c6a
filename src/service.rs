use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::catalog::{validate_identifier, Dataset, ParamSpec, View};
use crate::config::Config;
use crate::database::MetadataStore;
use crate::error::DataAccessError;
use crate::exec::{self, RowStream};
use crate::jobs::{RefreshDatasetJob, REFRESH_DATASET_JOB};
use crate::params::apply_params;
use crate::pool::EnginePool;
use crate::storage::DatasetStorage;
use crate::views::{build_view_query, compile_check, CachedQuery, QueryCache};

/// The data-access core: owns the engine pool, the view query cache and
/// the collaborating stores. Constructed once at startup and shared.
pub struct DataAccessService {
    config: Config,
    db: MetadataStore,
    pool: Arc<EnginePool>,
    storage: Arc<DatasetStorage>,
    cache: QueryCache,
}

impl DataAccessService {
    pub async fn new(config: Config) -> Result<Self, DataAccessError> {
        info!("Initializing data access service");

        let pool = Arc::new(EnginePool::new(&config.object_storage, config.pool_size)?);
        let storage = Arc::new(DatasetStorage::new(
            pool.object_store(),
            pool.bucket_url().clone(),
            config.upload_part_size,
            config.upload_concurrency,
        ));
        let db = MetadataStore::new(&config.metadata_db_url).await?;

        info!("Data access service initialized");

        Ok(Self {
            config,
            db,
            pool,
            storage,
            cache: QueryCache::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.db
    }

    pub fn engine_pool(&self) -> Arc<EnginePool> {
        self.pool.clone()
    }

    pub fn storage(&self) -> Arc<DatasetStorage> {
        self.storage.clone()
    }

    // ---- dataset lifecycle ------------------------------------------------

    /// Registers a dataset at fetching/0 and enqueues its first extract
    /// run. Returns once the job is durably queued.
    pub async fn create_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
        source_query: &str,
        tenant_subpath: Option<&str>,
        description: Option<&str>,
    ) -> Result<Dataset, DataAccessError> {
        validate_identifier("tenant", tenant)?;
        validate_identifier("dataset id", dataset_id)?;
        if let Some(sub) = tenant_subpath {
            validate_identifier("tenant subpath", sub)?;
        }

        let dataset = self
            .db
            .create_dataset(tenant, dataset_id, source_query, tenant_subpath, description)
            .await?;

        self.enqueue_refresh(tenant, dataset_id, source_query)
            .await?;
        Ok(dataset)
    }

    pub async fn list_datasets(&self, tenant: &str) -> Result<Vec<Dataset>, DataAccessError> {
        self.db.list_datasets(tenant).await
    }

    pub async fn get_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<Dataset, DataAccessError> {
        self.db.get_dataset(tenant, dataset_id).await
    }

    /// Atomically re-enters the lifecycle at fetching/0 (guarded in the
    /// shared store) and enqueues a fresh extract run. Existing views
    /// keep serving once the new parquet lands.
    pub async fn regenerate_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<(), DataAccessError> {
        let dataset = self.db.regenerate_dataset(tenant, dataset_id).await?;
        self.enqueue_refresh(tenant, dataset_id, &dataset.source_query)
            .await
    }

    /// Removes the metadata record and the backing parquet object. The
    /// object delete tolerates absence so datasets that never completed
    /// can still be removed.
    pub async fn delete_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<(), DataAccessError> {
        let dataset = self.db.get_dataset(tenant, dataset_id).await?;

        self.storage.delete_if_exists(&dataset.parquet_key()).await?;
        self.db.delete_dataset(tenant, dataset_id).await?;
        self.cache.remove_dataset(tenant, dataset_id).await;
        Ok(())
    }

    async fn enqueue_refresh(
        &self,
        tenant: &str,
        dataset_id: &str,
        source_query: &str,
    ) -> Result<(), DataAccessError> {
        let payload = serde_json::to_value(RefreshDatasetJob {
            tenant: tenant.to_string(),
            dataset_id: dataset_id.to_string(),
            source_query: source_query.to_string(),
        })?;
        self.db.enqueue_job(REFRESH_DATASET_JOB, &payload).await?;
        Ok(())
    }

    // ---- views ------------------------------------------------------------

    /// Builds, compile-validates and stores a view. The stored query is
    /// always the builder's wrapped form. `previous_id` is set on
    /// updates and may differ from the new id, renaming the view.
    pub async fn store_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
        description: &str,
        user_fragment: &str,
        params: Vec<ParamSpec>,
        previous_id: Option<&str>,
    ) -> Result<View, DataAccessError> {
        validate_identifier("view id", view_id)?;
        let dataset = self.db.get_dataset(tenant, dataset_id).await?;

        let parquet_url = self.storage.url_for(&dataset.parquet_key());
        let query = build_view_query(&parquet_url, user_fragment)?;

        // Definition-time compile check, so malformed SQL never reaches
        // first use.
        let conn = self.pool.acquire().await?;
        compile_check(&conn, &query)?;
        drop(conn);

        let view = View {
            id: view_id.to_string(),
            description: description.to_string(),
            query: query.clone(),
            params: params.clone(),
        };
        self.db
            .upsert_view(tenant, dataset_id, &view, previous_id)
            .await?;

        if let Some(old_id) = previous_id {
            self.cache.remove(tenant, dataset_id, old_id).await;
        }
        self.cache
            .insert(tenant, dataset_id, view_id, CachedQuery { query, params })
            .await;

        Ok(view)
    }

    pub async fn list_views(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<Vec<View>, DataAccessError> {
        let dataset = self.db.get_dataset(tenant, dataset_id).await?;
        Ok(dataset.views.into_values().collect())
    }

    pub async fn get_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<View, DataAccessError> {
        self.db.get_view(tenant, dataset_id, view_id).await
    }

    pub async fn delete_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<(), DataAccessError> {
        self.db.remove_view(tenant, dataset_id, view_id).await?;
        self.cache.remove(tenant, dataset_id, view_id).await;
        Ok(())
    }

    /// Cache lookup with lazy hydration from the persisted view
    /// definition on miss.
    async fn resolve_query(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<CachedQuery, DataAccessError> {
        if let Some(cached) = self.cache.get(tenant, dataset_id, view_id).await {
            return Ok(cached);
        }

        let view = self.db.get_view(tenant, dataset_id, view_id).await?;
        let cached = CachedQuery {
            query: view.query,
            params: view.params,
        };
        self.cache
            .insert(tenant, dataset_id, view_id, cached.clone())
            .await;
        Ok(cached)
    }

    // ---- query execution --------------------------------------------------

    /// Buffered execution: runs to completion and returns the ordered
    /// row set as JSON objects.
    pub async fn execute_query(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
        raw_params: &HashMap<String, String>,
    ) -> Result<Vec<serde_json::Value>, DataAccessError> {
        let conn = self.pool.acquire().await?;
        let cached = self.resolve_query(tenant, dataset_id, view_id).await?;
        let bound = apply_params(raw_params, &cached.params)?;
        exec::run_buffered(conn, &cached.query, bound).await
    }

    /// Streamed execution: returns a lazy NDJSON line stream that owns
    /// its pooled connection and releases it exactly once, including
    /// when the consumer disconnects mid-stream.
    pub async fn execute_query_stream(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
        raw_params: &HashMap<String, String>,
    ) -> Result<RowStream, DataAccessError> {
        let conn = self.pool.acquire().await?;
        let cached = self.resolve_query(tenant, dataset_id, view_id).await?;
        let bound = apply_params(raw_params, &cached.params)?;
        exec::run_streamed(conn, &cached.query, bound).await
    }
}
