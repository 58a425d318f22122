//! Speedrun announcer entry point.
//!
//! Everything interesting lives in the library; this file only sets up
//! logging and turns a fatal error into a non-zero exit status.

use tracing::error;
use tracing_subscriber::EnvFilter;

use speedrun_bot::config::{Config, LogFormat};

fn init_tracing(format: LogFormat) {
    // Respects RUST_LOG, defaults to info.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(
        config
            .as_ref()
            .map(|c| c.log_format)
            .unwrap_or_default(),
    );

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = speedrun_bot::bot::run(config).await {
        error!(error = %e, "bot stopped");
        std::process::exit(1);
    }
}
