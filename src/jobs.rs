use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::database::MetadataStore;
use crate::error::DataAccessError;

/// Task name for a full dataset refresh run.
pub const REFRESH_DATASET_JOB: &str = "refresh-dataset";

/// Payload of a refresh task. The dataset record, not this payload, is
/// the authoritative source of status; a redelivered job re-runs safely
/// because the pipeline's marks are idempotent and regeneration is
/// guarded in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshDatasetJob {
    pub tenant: String,
    pub dataset_id: String,
    pub source_query: String,
}

type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<(), DataAccessError>> + Send + Sync>;

/// Consumes the durable job queue and dispatches to handlers registered
/// by task name. The producer side is just
/// `MetadataStore::enqueue_job`; neither side assumes in-process,
/// synchronous execution.
pub struct JobDispatcher {
    db: MetadataStore,
    handlers: HashMap<String, Handler>,
    poll_interval: Duration,
    reclaim_after: Duration,
}

impl JobDispatcher {
    pub fn new(db: MetadataStore, poll_interval: Duration, reclaim_after: Duration) -> Self {
        Self {
            db,
            handlers: HashMap::new(),
            poll_interval,
            reclaim_after,
        }
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, Result<(), DataAccessError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Polls the queue until the surrounding task is cancelled. Each
    /// claimed job runs to completion before the next claim, and its
    /// outcome is recorded on the job row. Jobs whose worker died
    /// mid-run become claimable again after `reclaim_after`.
    pub async fn run(&self) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Job dispatcher started");
        loop {
            match self.db.claim_job(self.reclaim_after).await {
                Ok(Some(job)) => {
                    info!(job_id = job.id, job = %job.name, "Job starting");
                    let outcome = match self.handlers.get(&job.name) {
                        Some(handler) => handler(job.payload.clone()).await,
                        None => Err(DataAccessError::InternalError {
                            message: format!("No handler registered for job {:?}", job.name),
                        }),
                    };

                    let error_text = match &outcome {
                        Ok(()) => {
                            info!(job_id = job.id, job = %job.name, "Job completed successfully");
                            None
                        }
                        Err(e) => {
                            error!(job_id = job.id, job = %job.name, "Job failed: {}", e);
                            Some(e.to_string())
                        }
                    };

                    if let Err(e) = self.db.finish_job(job.id, error_text.as_deref()).await {
                        warn!(job_id = job.id, "Failed to record job outcome: {}", e);
                    }
                }
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    warn!("Failed to claim job: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
