pub mod config;
pub mod errors;
pub mod k8s;
pub mod lock;
pub mod metrics;
pub mod status;
pub mod telemetry;
