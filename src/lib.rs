pub mod aggregate;
pub mod daterange;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod query;
pub mod scheduler;
pub mod sources;
pub mod value;

pub use crate::db::Database;
pub use crate::engine::ReportEngine;
pub use crate::errors::{AppError, AppResult};
pub use crate::scheduler::ReportScheduler;
pub use crate::sources::DataSources;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Daily-rolling JSON logs under `<data_dir>/logs`. Call once at startup;
/// subsequent calls are no-ops.
pub fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "reports.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
