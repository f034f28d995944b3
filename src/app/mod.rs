mod config;
pub mod engine;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use error::AppError;

use config::AppConfig;

/// API plus the reachability synchronizer.
pub fn run() -> Result<(), AppError> {
    let config = init()?;
    runtime::run(config)
}

/// API only; timers fire on reads and nothing polls the router.
pub fn run_api() -> Result<(), AppError> {
    let config = init()?;
    runtime::run_api(config)
}

fn init() -> Result<AppConfig, AppError> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        router_url = config.router.as_ref().map(|router| router.url.as_str()),
        sync_interval_ms = config.sync_interval_ms,
        debounce_samples = config.debounce_samples,
        rounding_step = %config.rounding_step,
        monitor_webhook = config.monitor_webhook_url.is_some(),
        "application bootstrap initialized"
    );

    Ok(config)
}
