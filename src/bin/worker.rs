use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use data_access_service::database::MetadataStore;
use data_access_service::jobs::{JobDispatcher, RefreshDatasetJob, REFRESH_DATASET_JOB};
use data_access_service::pipeline::EtlPipeline;
use data_access_service::pool::EnginePool;
use data_access_service::storage::DatasetStorage;
use data_access_service::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "data_access_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Data Access Worker v0.1.0");

    let config = Config::from_env()?;
    let pool = Arc::new(EnginePool::new(&config.object_storage, config.pool_size)?);
    let storage = Arc::new(DatasetStorage::new(
        pool.object_store(),
        pool.bucket_url().clone(),
        config.upload_part_size,
        config.upload_concurrency,
    ));
    let db = MetadataStore::new(&config.metadata_db_url).await?;
    let pipeline = Arc::new(EtlPipeline::new(
        db.clone(),
        pool,
        storage,
        config.source_db.clone(),
    ));

    let mut dispatcher = JobDispatcher::new(
        db,
        Duration::from_millis(config.job_poll_interval_ms),
        Duration::from_millis(config.job_reclaim_timeout_ms),
    );
    dispatcher.register(REFRESH_DATASET_JOB, move |payload| {
        let pipeline = pipeline.clone();
        async move {
            let job: RefreshDatasetJob = serde_json::from_value(payload)?;
            pipeline
                .run_extract(&job.tenant, &job.dataset_id, &job.source_query)
                .await
        }
        .boxed()
    });

    info!("Data Access Worker started successfully");

    tokio::select! {
        _ = dispatcher.run() => {}
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal, gracefully shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        }
    }

    info!("Data Access Worker shutdown complete");
    Ok(())
}
