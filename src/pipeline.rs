use futures::StreamExt;
use std::sync::Arc;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use crate::catalog::DatasetStatus;
use crate::config::SourceDbConfig;
use crate::database::MetadataStore;
use crate::error::DataAccessError;
use crate::pool::EnginePool;
use crate::storage::DatasetStorage;

/// Moves one dataset from the relational source through object storage
/// into parquet, reporting progress into the dataset record. Safe to
/// re-enter: every step mark is idempotent and the regeneration guard
/// prevents two concurrent runs for the same dataset.
pub struct EtlPipeline {
    db: MetadataStore,
    pool: Arc<EnginePool>,
    storage: Arc<DatasetStorage>,
    source_db: SourceDbConfig,
}

impl EtlPipeline {
    pub fn new(
        db: MetadataStore,
        pool: Arc<EnginePool>,
        storage: Arc<DatasetStorage>,
        source_db: SourceDbConfig,
    ) -> Self {
        Self {
            db,
            pool,
            storage,
            source_db,
        }
    }

    /// Runs the full extract for a dataset. Any failing step marks the
    /// dataset failed with the captured error and re-raises so the
    /// caller can log it; no partial artifact is ever referenced by a
    /// completed status.
    pub async fn run_extract(
        &self,
        tenant: &str,
        dataset_id: &str,
        source_query: &str,
    ) -> Result<(), DataAccessError> {
        let result = self.run_steps(tenant, dataset_id, source_query).await;

        if let Err(e) = &result {
            error!(tenant, dataset_id, "Dataset extract failed: {}", e);
            if let Err(mark_err) = self
                .db
                .update_status(tenant, dataset_id, DatasetStatus::Failed, Some(&e.to_string()))
                .await
            {
                error!(tenant, dataset_id, "Failed to record failure: {}", mark_err);
            }
        }

        result
    }

    async fn run_steps(
        &self,
        tenant: &str,
        dataset_id: &str,
        source_query: &str,
    ) -> Result<(), DataAccessError> {
        let dataset = self.db.get_dataset(tenant, dataset_id).await?;
        let csv_key = dataset.csv_key();
        let parquet_key = dataset.parquet_key();

        self.db
            .update_status(tenant, dataset_id, DatasetStatus::Fetching, None)
            .await?;
        self.export_to_csv(tenant, source_query, &csv_key).await?;

        self.db
            .update_status(tenant, dataset_id, DatasetStatus::Transforming, None)
            .await?;
        self.convert_to_parquet(&csv_key, &parquet_key).await?;

        self.db
            .update_status(tenant, dataset_id, DatasetStatus::Uploading, None)
            .await?;
        self.storage.delete(&csv_key).await?;

        self.db
            .update_status(tenant, dataset_id, DatasetStatus::Completed, None)
            .await?;

        info!(tenant, dataset_id, "Dataset extract completed");
        Ok(())
    }

    /// Streams a CSV export of the source query straight into a
    /// multipart upload. The source rows are only pulled as upload
    /// parts complete, so bucket backpressure propagates to the source;
    /// dropping the stream on error releases the COPY cursor.
    async fn export_to_csv(
        &self,
        tenant: &str,
        source_query: &str,
        csv_key: &str,
    ) -> Result<(), DataAccessError> {
        info!(tenant, csv_key, "Exporting source rows");

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.source_db.host)
            .port(self.source_db.port)
            .user(&self.source_db.user)
            .password(&self.source_db.password)
            // The tenant names the source database; it is restricted to
            // [A-Za-z0-9_-] at the API boundary.
            .dbname(tenant);

        let (client, connection) = pg_config.connect(NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Source connection ended with error: {}", e);
            }
        });

        // The extraction query text is trusted administrator input and
        // passed to the source verbatim.
        let copy_sql = format!("COPY ({}) TO STDOUT WITH (FORMAT csv, HEADER)", source_query);
        let export = client.copy_out(copy_sql.as_str()).await?;

        let byte_stream = export.map(|chunk| chunk.map_err(DataAccessError::from)).boxed();
        let upload = self.storage.upload_stream(csv_key, byte_stream).await;

        drop(client);
        driver.abort();

        upload.map(|_| ())
    }

    /// Rewrites the staged CSV object as parquet through the engine's
    /// native reader and writer.
    async fn convert_to_parquet(
        &self,
        csv_key: &str,
        parquet_key: &str,
    ) -> Result<(), DataAccessError> {
        let csv_url = self.storage.url_for(csv_key);
        let parquet_url = self.storage.url_for(parquet_key);
        info!(%csv_url, %parquet_url, "Converting to parquet");

        let conn = self.pool.acquire().await?;
        let copy_sql = format!(
            "COPY (SELECT * FROM '{}') TO '{}' STORED AS PARQUET",
            csv_url, parquet_url
        );
        conn.ctx().sql(&copy_sql).await?.collect().await?;
        Ok(())
    }
}
