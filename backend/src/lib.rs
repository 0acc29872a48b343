pub mod config;
pub mod error;
pub mod inference;
pub mod report;
pub mod routes;
pub mod triage;

pub use config::AppConfig;
pub use error::InferenceError;
pub use report::ScanService;
