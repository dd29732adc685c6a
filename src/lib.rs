pub mod catalog;
pub mod compat;
pub mod config;
pub mod database;
pub mod error;
pub mod exec;
pub mod http;
pub mod jobs;
pub mod models;
pub mod params;
pub mod pipeline;
pub mod pool;
pub mod schema;
pub mod service;
pub mod storage;
pub mod views;

pub use config::Config;
pub use error::DataAccessError;
pub use service::DataAccessService;
