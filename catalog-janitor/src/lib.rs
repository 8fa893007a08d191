pub mod app_context;
pub mod config;
pub mod http;
pub mod janitor;
pub mod metrics_constants;
