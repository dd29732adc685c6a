use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DataAccessError;

/// Lifecycle of a dataset extract. Regular runs advance
/// fetching -> transforming -> uploading -> completed; any pipeline
/// error moves the dataset to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Fetching,
    Transforming,
    Uploading,
    Completed,
    Failed,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Fetching => "fetching",
            DatasetStatus::Transforming => "transforming",
            DatasetStatus::Uploading => "uploading",
            DatasetStatus::Completed => "completed",
            DatasetStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fetching" => Some(DatasetStatus::Fetching),
            "transforming" => Some(DatasetStatus::Transforming),
            "uploading" => Some(DatasetStatus::Uploading),
            "completed" => Some(DatasetStatus::Completed),
            "failed" => Some(DatasetStatus::Failed),
            _ => None,
        }
    }

    /// Progress mark emitted when the pipeline enters this state.
    pub fn progress(&self) -> i32 {
        match self {
            DatasetStatus::Fetching => 20,
            DatasetStatus::Transforming => 60,
            DatasetStatus::Uploading => 80,
            DatasetStatus::Completed => 100,
            DatasetStatus::Failed => 0,
        }
    }
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named, tenant-scoped extract of source data materialized as a
/// parquet object, together with its parameterized views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub tenant: String,
    pub id: String,
    pub source_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_subpath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: DatasetStatus,
    pub progress: i32,
    pub last_fetch: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub views: BTreeMap<String, View>,
}

impl Dataset {
    /// Object key of the materialized parquet within the bucket.
    pub fn parquet_key(&self) -> String {
        object_key(
            &self.tenant,
            self.tenant_subpath.as_deref(),
            &self.id,
            "parquet",
        )
    }

    /// Object key of the temporary CSV staged by the pipeline.
    pub fn csv_key(&self) -> String {
        object_key(&self.tenant, self.tenant_subpath.as_deref(), &self.id, "csv")
    }
}

/// A named, parameterized query over a dataset's parquet object. The
/// stored query is always builder-produced; the raw user fragment never
/// reaches the engine on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    pub description: String,
    pub query: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Numeric,
    Boolean,
    String,
    Date,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Numeric => "numeric",
            ParamType::Boolean => "boolean",
            ParamType::String => "string",
            ParamType::Date => "date",
        }
    }
}

/// Declared contract of a single view parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
}

pub fn object_key(
    tenant: &str,
    subpath: Option<&str>,
    dataset_id: &str,
    extension: &str,
) -> String {
    match subpath {
        Some(sub) if !sub.is_empty() => format!("{}/{}/{}.{}", tenant, sub, dataset_id, extension),
        _ => format!("{}/{}.{}", tenant, dataset_id, extension),
    }
}

/// Identifiers end up interpolated into SQL text and object keys, so
/// they are restricted to a safe character set at the boundary.
pub fn validate_identifier(label: &str, value: &str) -> Result<(), DataAccessError> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DataAccessError::BadRequest {
            message: format!("{} must match [A-Za-z0-9_-]+, got {:?}", label, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DatasetStatus::Fetching,
            DatasetStatus::Transforming,
            DatasetStatus::Uploading,
            DatasetStatus::Completed,
            DatasetStatus::Failed,
        ] {
            assert_eq!(DatasetStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DatasetStatus::parse("unknown"), None);
    }

    #[test]
    fn object_key_includes_optional_subpath() {
        assert_eq!(
            object_key("acme", None, "sales", "parquet"),
            "acme/sales.parquet"
        );
        assert_eq!(
            object_key("acme", Some("north"), "sales", "csv"),
            "acme/north/sales.csv"
        );
    }

    #[test]
    fn identifier_validation_rejects_path_tricks() {
        assert!(validate_identifier("tenant", "acme_01").is_ok());
        assert!(validate_identifier("tenant", "../other").is_err());
        assert!(validate_identifier("tenant", "a'; DROP TABLE x").is_err());
        assert!(validate_identifier("tenant", "").is_err());
    }
}
