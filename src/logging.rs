use std::path::Path;

use anyhow::Result;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Console + daily-rotated file logging. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init(log_dir: &str, service_name: &str) -> Result<()> {
    let _ = backup_previous_log(log_dir, service_name);
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    // The guards must outlive the process for the writers to keep flushing.
    std::mem::forget(file_guard);
    std::mem::forget(stdout_guard);

    info!("logging initialized, writing to {log_dir}/{service_name}.log");
    Ok(())
}

fn backup_previous_log(log_dir: &str, service_name: &str) -> Result<()> {
    let log_file = format!("{log_dir}/{service_name}.log");
    if Path::new(&log_file).exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = format!("{log_dir}/{service_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup)?;
    }
    Ok(())
}
