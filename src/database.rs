use chrono::Utc;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::catalog::{Dataset, DatasetStatus, View};
use crate::error::DataAccessError;
use crate::models::{DatasetRow, JobRow, NewDatasetRow, NewJobRow};
use crate::schema::{datasets, jobs};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Persisted metadata store: one record per dataset with its views
/// embedded, plus the durable job queue. This is the sole source of
/// cross-process truth for dataset state.
#[derive(Clone)]
pub struct MetadataStore {
    pool: Pool<AsyncPgConnection>,
}

impl MetadataStore {
    pub async fn new(database_url: &str) -> Result<Self, DataAccessError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(config)
            .build()
            .map_err(|e| DataAccessError::ConfigError {
                message: format!("Failed to create metadata database pool: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations(database_url)?;

        Ok(store)
    }

    fn run_migrations(&self, database_url: &str) -> Result<(), DataAccessError> {
        use diesel::Connection;
        use diesel::PgConnection;

        // diesel_migrations has no async harness yet, so migrations run
        // over a one-off synchronous connection.
        let mut connection =
            PgConnection::establish(database_url).map_err(|e| DataAccessError::ConfigError {
                message: format!("Failed to establish connection for migrations: {}", e),
            })?;

        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| DataAccessError::ConfigError {
                message: format!("Failed to run migrations: {}", e),
            })?;

        Ok(())
    }

    async fn conn(
        &self,
    ) -> Result<diesel_async::pooled_connection::deadpool::Object<AsyncPgConnection>, DataAccessError>
    {
        self.pool
            .get()
            .await
            .map_err(|e| DataAccessError::MetadataError {
                message: format!("Failed to get metadata database connection: {}", e),
            })
    }

    /// Atomic insert of a new dataset at fetching/0. The composite
    /// primary key turns a duplicate (tenant, id) into a conflict.
    pub async fn create_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
        source_query: &str,
        tenant_subpath: Option<&str>,
        description: Option<&str>,
    ) -> Result<Dataset, DataAccessError> {
        info!(tenant, dataset_id, "Creating dataset record");
        let mut conn = self.conn().await?;

        let empty_views = serde_json::json!({});
        let row = NewDatasetRow {
            tenant,
            id: dataset_id,
            source_query,
            tenant_subpath,
            description,
            status: DatasetStatus::Fetching.as_str(),
            progress: 0,
            last_fetch: Utc::now(),
            views: &empty_views,
        };

        let inserted: DatasetRow = diesel::insert_into(datasets::table)
            .values(&row)
            .get_result(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    DataAccessError::DuplicatedKey {
                        tenant: tenant.to_string(),
                        dataset_id: dataset_id.to_string(),
                    }
                }
                other => other.into(),
            })?;

        inserted.try_into()
    }

    pub async fn list_datasets(&self, tenant: &str) -> Result<Vec<Dataset>, DataAccessError> {
        let mut conn = self.conn().await?;

        let rows: Vec<DatasetRow> = datasets::table
            .filter(datasets::tenant.eq(tenant))
            .order(datasets::id.asc())
            .get_results(&mut conn)
            .await?;

        rows.into_iter().map(Dataset::try_from).collect()
    }

    pub async fn get_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<Dataset, DataAccessError> {
        let mut conn = self.conn().await?;

        let row: Option<DatasetRow> = datasets::table
            .find((tenant, dataset_id))
            .get_result(&mut conn)
            .await
            .optional()?;

        row.ok_or_else(|| DataAccessError::DatasetNotFound {
            tenant: tenant.to_string(),
            dataset_id: dataset_id.to_string(),
        })?
        .try_into()
    }

    pub async fn delete_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<(), DataAccessError> {
        info!(tenant, dataset_id, "Deleting dataset record");
        let mut conn = self.conn().await?;

        let deleted = diesel::delete(datasets::table.find((tenant, dataset_id)))
            .execute(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(DataAccessError::DatasetNotFound {
                tenant: tenant.to_string(),
                dataset_id: dataset_id.to_string(),
            });
        }
        Ok(())
    }

    /// Single conditional transition to fetching/0, applied only from
    /// completed or failed. The guard lives in this one statement so it
    /// is race-free across concurrent callers and service instances,
    /// and the row as it stood before the transition is returned; a
    /// non-applying update is re-read and classified.
    pub async fn regenerate_dataset(
        &self,
        tenant: &str,
        dataset_id: &str,
    ) -> Result<Dataset, DataAccessError> {
        use diesel::sql_types::Text;

        let mut conn = self.conn().await?;

        let prior: Option<DatasetRow> = diesel::sql_query(
            "WITH prior AS (\
                 SELECT * FROM datasets \
                 WHERE tenant = $1 AND id = $2 AND status IN ('completed', 'failed') \
                 FOR UPDATE\
             ) \
             UPDATE datasets \
             SET status = 'fetching', progress = 0, last_fetch = now(), error = NULL \
             FROM prior \
             WHERE datasets.tenant = prior.tenant AND datasets.id = prior.id \
             RETURNING prior.tenant, prior.id, prior.source_query, prior.tenant_subpath, \
                       prior.description, prior.status, prior.progress, prior.last_fetch, \
                       prior.error, prior.views",
        )
        .bind::<Text, _>(tenant)
        .bind::<Text, _>(dataset_id)
        .get_result(&mut conn)
        .await
        .optional()?;

        match prior {
            Some(row) => row.try_into(),
            None => {
                let current: Option<DatasetRow> = datasets::table
                    .find((tenant, dataset_id))
                    .get_result(&mut conn)
                    .await
                    .optional()?;

                match current {
                    None => Err(DataAccessError::DatasetNotFound {
                        tenant: tenant.to_string(),
                        dataset_id: dataset_id.to_string(),
                    }),
                    Some(row) if row.status == DatasetStatus::Fetching.as_str() => {
                        Err(DataAccessError::AlreadyFetching {
                            dataset_id: dataset_id.to_string(),
                        })
                    }
                    Some(row) => Err(DataAccessError::InvalidState {
                        dataset_id: dataset_id.to_string(),
                        status: row.status,
                    }),
                }
            }
        }
    }

    /// Step mark emitted by the ETL pipeline. Idempotent: re-running a
    /// step writes the same status/progress pair again.
    pub async fn update_status(
        &self,
        tenant: &str,
        dataset_id: &str,
        status: DatasetStatus,
        error: Option<&str>,
    ) -> Result<(), DataAccessError> {
        let mut conn = self.conn().await?;

        diesel::update(datasets::table.find((tenant, dataset_id)))
            .set((
                datasets::status.eq(status.as_str()),
                datasets::progress.eq(status.progress()),
                datasets::last_fetch.eq(Utc::now()),
                datasets::error.eq(error),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Insert or replace a view definition inside the dataset record.
    /// `previous_id` supports renames: it is removed when it differs
    /// from the new view id. Each call touches only its own key of the
    /// views map, so concurrent writers on one dataset never clobber
    /// each other's entries.
    pub async fn upsert_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view: &View,
        previous_id: Option<&str>,
    ) -> Result<(), DataAccessError> {
        use diesel::sql_types::{Jsonb, Text};

        info!(tenant, dataset_id, view_id = %view.id, "Storing view definition");
        let mut conn = self.conn().await?;
        let value = serde_json::to_value(view)?;

        let updated = match previous_id.filter(|old| *old != view.id) {
            Some(old_id) => {
                let updated = diesel::sql_query(
                    "UPDATE datasets \
                     SET views = jsonb_set(views - $3, ARRAY[$4], $5) \
                     WHERE tenant = $1 AND id = $2 AND jsonb_exists(views, $3)",
                )
                .bind::<Text, _>(tenant)
                .bind::<Text, _>(dataset_id)
                .bind::<Text, _>(old_id)
                .bind::<Text, _>(&view.id)
                .bind::<Jsonb, _>(value)
                .execute(&mut conn)
                .await?;

                if updated == 0 {
                    // The dataset exists but the renamed view does not,
                    // or the dataset itself is gone.
                    drop(conn);
                    self.get_dataset(tenant, dataset_id).await?;
                    return Err(DataAccessError::ViewNotFound {
                        tenant: tenant.to_string(),
                        dataset_id: dataset_id.to_string(),
                        view_id: old_id.to_string(),
                    });
                }
                updated
            }
            None => {
                diesel::sql_query(
                    "UPDATE datasets \
                     SET views = jsonb_set(views, ARRAY[$3], $4) \
                     WHERE tenant = $1 AND id = $2",
                )
                .bind::<Text, _>(tenant)
                .bind::<Text, _>(dataset_id)
                .bind::<Text, _>(&view.id)
                .bind::<Jsonb, _>(value)
                .execute(&mut conn)
                .await?
            }
        };

        if updated == 0 {
            return Err(DataAccessError::DatasetNotFound {
                tenant: tenant.to_string(),
                dataset_id: dataset_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<View, DataAccessError> {
        let dataset = self.get_dataset(tenant, dataset_id).await?;
        dataset
            .views
            .get(view_id)
            .cloned()
            .ok_or_else(|| DataAccessError::ViewNotFound {
                tenant: tenant.to_string(),
                dataset_id: dataset_id.to_string(),
                view_id: view_id.to_string(),
            })
    }

    /// Drops a single key from the views map. The guard on key
    /// existence and the removal happen in one statement, so this never
    /// rewrites entries written concurrently.
    pub async fn remove_view(
        &self,
        tenant: &str,
        dataset_id: &str,
        view_id: &str,
    ) -> Result<(), DataAccessError> {
        use diesel::sql_types::Text;

        let mut conn = self.conn().await?;

        let updated = diesel::sql_query(
            "UPDATE datasets SET views = views - $3 \
             WHERE tenant = $1 AND id = $2 AND jsonb_exists(views, $3)",
        )
        .bind::<Text, _>(tenant)
        .bind::<Text, _>(dataset_id)
        .bind::<Text, _>(view_id)
        .execute(&mut conn)
        .await?;

        if updated == 0 {
            drop(conn);
            self.get_dataset(tenant, dataset_id).await?;
            return Err(DataAccessError::ViewNotFound {
                tenant: tenant.to_string(),
                dataset_id: dataset_id.to_string(),
                view_id: view_id.to_string(),
            });
        }
        Ok(())
    }

    /// Durable enqueue with at-least-once delivery semantics.
    pub async fn enqueue_job(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, DataAccessError> {
        let mut conn = self.conn().await?;

        let row: JobRow = diesel::insert_into(jobs::table)
            .values(&NewJobRow {
                name,
                payload,
                status: "queued",
            })
            .get_result(&mut conn)
            .await?;

        info!(job_id = row.id, job = name, "Enqueued job");
        Ok(row.id)
    }

    /// Claim the oldest runnable job. SKIP LOCKED keeps concurrent
    /// workers from claiming the same row. Jobs stuck in `running`
    /// longer than `reclaim_after` are claimable again, so a worker
    /// crash mid-job delays redelivery instead of losing it; handlers
    /// are re-run safe.
    pub async fn claim_job(
        &self,
        reclaim_after: std::time::Duration,
    ) -> Result<Option<JobRow>, DataAccessError> {
        use diesel::sql_types::BigInt;

        let mut conn = self.conn().await?;

        let claimed: Option<JobRow> = diesel::sql_query(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = now() \
             WHERE id = (SELECT id FROM jobs \
                 WHERE status = 'queued' \
                    OR (status = 'running' AND updated_at < now() - ($1 * interval '1 second')) \
                 ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1) \
             RETURNING id, name, payload, status, attempts, error, created_at, updated_at",
        )
        .bind::<BigInt, _>(reclaim_after.as_secs() as i64)
        .get_result(&mut conn)
        .await
        .optional()?;

        Ok(claimed)
    }

    pub async fn finish_job(
        &self,
        job_id: i64,
        error: Option<&str>,
    ) -> Result<(), DataAccessError> {
        let mut conn = self.conn().await?;

        let status = if error.is_some() { "failed" } else { "done" };
        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::status.eq(status),
                jobs::error.eq(error),
                jobs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}
