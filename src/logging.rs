use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the tracing subscriber for the pkgswarm process.
pub fn init_logging(default_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pkgswarm={}", default_level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("pkgswarm logging initialized");
    Ok(())
}

/// Initialize logging with fallback behavior if setup fails.
pub fn init_logging_safe(default_level: &str) {
    if let Err(e) = init_logging(default_level) {
        eprintln!(
            "Warning: failed to set up structured logging: {}. Continuing without it.",
            e
        );
    }
}
