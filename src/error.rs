use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Service-wide error taxonomy. Every variant maps to a stable
/// machine-readable kind and an HTTP status.
#[derive(Error, Debug)]
pub enum DataAccessError {
    #[error("Missing params in the request: {message}")]
    BadRequest { message: String },

    #[error("Dataset {dataset_id} not found in tenant {tenant}")]
    DatasetNotFound { tenant: String, dataset_id: String },

    #[error("View {view_id} not found in dataset {dataset_id} of tenant {tenant}")]
    ViewNotFound {
        tenant: String,
        dataset_id: String,
        view_id: String,
    },

    #[error("Invalid view query: {message}")]
    InvalidViewQuery { message: String },

    #[error("Missing required parameter: {name}")]
    MissingRequiredParam { name: String },

    #[error("Parameter {name} has invalid value for type {expected}: {value}")]
    InvalidType {
        name: String,
        expected: String,
        value: String,
    },

    #[error("Parameter {name} value {value} is outside the range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Parameter {name} value {value} is not an allowed choice")]
    NotInEnum { name: String, value: String },

    #[error("Dataset {dataset_id} already exists in tenant {tenant}")]
    DuplicatedKey { tenant: String, dataset_id: String },

    #[error("Dataset {dataset_id} is already being regenerated")]
    AlreadyFetching { dataset_id: String },

    #[error("Dataset {dataset_id} cannot be regenerated from status {status}")]
    InvalidState { dataset_id: String, status: String },

    #[error("Relational source error: {message}")]
    SourceError { message: String },

    #[error("Object storage error: {message}")]
    StorageError { message: String },

    #[error("Query engine error: {message}")]
    EngineError { message: String },

    #[error("Metadata store error: {message}")]
    MetadataError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl DataAccessError {
    /// Stable kind string surfaced in error payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DataAccessError::BadRequest { .. } => "BadRequest",
            DataAccessError::DatasetNotFound { .. } => "DatasetNotFound",
            DataAccessError::ViewNotFound { .. } => "ViewNotFound",
            DataAccessError::InvalidViewQuery { .. } => "InvalidDAQuery",
            DataAccessError::MissingRequiredParam { .. } => "MissingRequiredParam",
            DataAccessError::InvalidType { .. } => "InvalidType",
            DataAccessError::OutOfRange { .. } => "OutOfRange",
            DataAccessError::NotInEnum { .. } => "NotInEnum",
            DataAccessError::DuplicatedKey { .. } => "DuplicatedKey",
            DataAccessError::AlreadyFetching { .. } => "AlreadyFetching",
            DataAccessError::InvalidState { .. } => "InvalidState",
            DataAccessError::SourceError { .. } => "SourceError",
            DataAccessError::StorageError { .. } => "StorageError",
            DataAccessError::EngineError { .. } => "EngineError",
            DataAccessError::MetadataError { .. } => "MetadataError",
            DataAccessError::ConfigError { .. } => "ConfigError",
            DataAccessError::InternalError { .. } => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DataAccessError::BadRequest { .. }
            | DataAccessError::InvalidViewQuery { .. }
            | DataAccessError::MissingRequiredParam { .. }
            | DataAccessError::InvalidType { .. }
            | DataAccessError::OutOfRange { .. }
            | DataAccessError::NotInEnum { .. } => StatusCode::BAD_REQUEST,
            DataAccessError::DatasetNotFound { .. } | DataAccessError::ViewNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            DataAccessError::DuplicatedKey { .. }
            | DataAccessError::AlreadyFetching { .. }
            | DataAccessError::InvalidState { .. } => StatusCode::CONFLICT,
            DataAccessError::SourceError { .. }
            | DataAccessError::StorageError { .. }
            | DataAccessError::EngineError { .. }
            | DataAccessError::MetadataError { .. } => StatusCode::BAD_GATEWAY,
            DataAccessError::ConfigError { .. } | DataAccessError::InternalError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DataAccessError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind(),
            "description": self.to_string(),
        });
        (self.status_code(), body.to_string()).into_response()
    }
}

impl From<datafusion::error::DataFusionError> for DataAccessError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        DataAccessError::EngineError {
            message: err.to_string(),
        }
    }
}

impl From<datafusion::arrow::error::ArrowError> for DataAccessError {
    fn from(err: datafusion::arrow::error::ArrowError) -> Self {
        DataAccessError::EngineError {
            message: err.to_string(),
        }
    }
}

impl From<object_store::Error> for DataAccessError {
    fn from(err: object_store::Error) -> Self {
        DataAccessError::StorageError {
            message: err.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for DataAccessError {
    fn from(err: tokio_postgres::Error) -> Self {
        DataAccessError::SourceError {
            message: err.to_string(),
        }
    }
}

impl From<diesel::result::Error> for DataAccessError {
    fn from(err: diesel::result::Error) -> Self {
        DataAccessError::MetadataError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DataAccessError {
    fn from(err: serde_json::Error) -> Self {
        DataAccessError::InternalError {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for DataAccessError {
    fn from(err: std::io::Error) -> Self {
        DataAccessError::InternalError {
            message: err.to_string(),
        }
    }
}
