use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::catalog::ParamSpec;
use crate::compat::{adapt_legacy_params, to_legacy_result};
use crate::error::DataAccessError;
use crate::service::DataAccessService;

const TENANT_HEADER: &str = "x-tenant-id";
const NDJSON: &str = "application/x-ndjson";

pub fn router(service: Arc<DataAccessService>) -> Router {
    Router::new()
        .route("/datasets", post(create_dataset).get(list_datasets))
        .route(
            "/datasets/{dataset_id}",
            get(get_dataset)
                .put(regenerate_dataset)
                .delete(delete_dataset),
        )
        .route(
            "/datasets/{dataset_id}/views",
            post(create_view).get(list_views),
        )
        .route(
            "/datasets/{dataset_id}/views/{view_id}",
            get(get_view).put(update_view).delete(delete_view),
        )
        .route("/query", get(run_query))
        .route("/legacy/query", get(run_legacy_query))
        .with_state(service)
}

fn tenant_of(headers: &HeaderMap) -> Result<String, DataAccessError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DataAccessError::BadRequest {
            message: format!("{} header is required", TENANT_HEADER),
        })
}

fn required<T>(field: Option<T>, name: &str) -> Result<T, DataAccessError> {
    field.ok_or_else(|| DataAccessError::BadRequest {
        message: format!("{} is required", name),
    })
}

// ---- datasets -------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDatasetRequest {
    id: Option<String>,
    source_query: Option<String>,
    subpath: Option<String>,
    description: Option<String>,
}

async fn create_dataset(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Json(body): Json<CreateDatasetRequest>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let id = required(body.id, "id")?;
    let source_query = required(body.source_query, "sourceQuery")?;

    info!(tenant, dataset = %id, "Creating dataset");
    let dataset = service
        .create_dataset(
            &tenant,
            &id,
            &source_query,
            body.subpath.as_deref(),
            body.description.as_deref(),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(dataset)).into_response())
}

async fn list_datasets(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let datasets = service.list_datasets(&tenant).await?;
    Ok(Json(datasets).into_response())
}

async fn get_dataset(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let dataset = service.get_dataset(&tenant, &dataset_id).await?;
    Ok(Json(dataset).into_response())
}

async fn regenerate_dataset(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    info!(tenant, dataset = %dataset_id, "Regenerating dataset");
    service.regenerate_dataset(&tenant, &dataset_id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn delete_dataset(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    info!(tenant, dataset = %dataset_id, "Deleting dataset");
    service.delete_dataset(&tenant, &dataset_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- views ----------------------------------------------------------------

#[derive(Deserialize)]
struct ViewRequest {
    id: Option<String>,
    description: Option<String>,
    query: Option<String>,
    #[serde(default)]
    params: Vec<ParamSpec>,
}

async fn create_view(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
    Json(body): Json<ViewRequest>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let view_id = required(body.id, "id")?;
    let query = required(body.query, "query")?;

    let view = service
        .store_view(
            &tenant,
            &dataset_id,
            &view_id,
            body.description.as_deref().unwrap_or(""),
            &query,
            body.params,
            None,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn update_view(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path((dataset_id, view_id)): Path<(String, String)>,
    Json(body): Json<ViewRequest>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    // A differing id in the body renames the view.
    let new_id = body.id.unwrap_or_else(|| view_id.clone());
    let query = required(body.query, "query")?;

    let view = service
        .store_view(
            &tenant,
            &dataset_id,
            &new_id,
            body.description.as_deref().unwrap_or(""),
            &query,
            body.params,
            Some(&view_id),
        )
        .await?;
    Ok(Json(view).into_response())
}

async fn list_views(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let views = service.list_views(&tenant, &dataset_id).await?;
    Ok(Json(views).into_response())
}

async fn get_view(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path((dataset_id, view_id)): Path<(String, String)>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let view = service.get_view(&tenant, &dataset_id, &view_id).await?;
    Ok(Json(view).into_response())
}

async fn delete_view(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Path((dataset_id, view_id)): Path<(String, String)>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    service.delete_view(&tenant, &dataset_id, &view_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- query execution ------------------------------------------------------

async fn run_query(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Query(mut query): Query<HashMap<String, String>>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let dataset_id = required(query.remove("datasetId"), "datasetId")?;
    let view_id = required(query.remove("viewId"), "viewId")?;

    let wants_ndjson = headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(NDJSON));

    if wants_ndjson {
        let stream = service
            .execute_query_stream(&tenant, &dataset_id, &view_id, &query)
            .await?;
        let response = Response::builder()
            .header(CONTENT_TYPE, NDJSON)
            .body(Body::from_stream(stream))
            .map_err(|err| DataAccessError::InternalError {
                message: err.to_string(),
            })?;
        return Ok(response);
    }

    let rows = service
        .execute_query(&tenant, &dataset_id, &view_id, &query)
        .await?;
    Ok(Json(rows).into_response())
}

async fn run_legacy_query(
    State(service): State<Arc<DataAccessService>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, DataAccessError> {
    let tenant = tenant_of(&headers)?;
    let legacy = adapt_legacy_params(&query)?;

    let rows = service
        .execute_query(&tenant, &legacy.dataset_id, &legacy.view_id, &legacy.params)
        .await?;
    Ok(Json(to_legacy_result(&rows, legacy.page_start, legacy.page_size)).into_response())
}
