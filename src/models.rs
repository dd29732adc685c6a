use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::collections::BTreeMap;

use crate::catalog::{Dataset, DatasetStatus, View};
use crate::error::DataAccessError;
use crate::schema::{datasets, jobs};

#[derive(Queryable, QueryableByName, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = datasets)]
#[diesel(primary_key(tenant, id))]
pub struct DatasetRow {
    pub tenant: String,
    pub id: String,
    pub source_query: String,
    pub tenant_subpath: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub progress: i32,
    pub last_fetch: DateTime<Utc>,
    pub error: Option<String>,
    pub views: serde_json::Value,
}

#[derive(Insertable)]
#[diesel(table_name = datasets)]
pub struct NewDatasetRow<'a> {
    pub tenant: &'a str,
    pub id: &'a str,
    pub source_query: &'a str,
    pub tenant_subpath: Option<&'a str>,
    pub description: Option<&'a str>,
    pub status: &'a str,
    pub progress: i32,
    pub last_fetch: DateTime<Utc>,
    pub views: &'a serde_json::Value,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = DataAccessError;

    fn try_from(row: DatasetRow) -> Result<Self, Self::Error> {
        let status =
            DatasetStatus::parse(&row.status).ok_or_else(|| DataAccessError::MetadataError {
                message: format!("Unknown dataset status {:?} for {}", row.status, row.id),
            })?;
        let views: BTreeMap<String, View> = serde_json::from_value(row.views)?;

        Ok(Dataset {
            tenant: row.tenant,
            id: row.id,
            source_query: row.source_query,
            tenant_subpath: row.tenant_subpath,
            description: row.description,
            status,
            progress: row.progress,
            last_fetch: row.last_fetch,
            error: row.error,
            views,
        })
    }
}

#[derive(Queryable, QueryableByName, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = jobs)]
pub struct JobRow {
    pub id: i64,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJobRow<'a> {
    pub name: &'a str,
    pub payload: &'a serde_json::Value,
    pub status: &'a str,
}
