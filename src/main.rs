use anyhow::Result;
use clap::Parser;
use pkgswarm::audit_logger::AuditLogger;
use pkgswarm::cli::{Cli, Commands};
use pkgswarm::config::Config;
use pkgswarm::logging;
use pkgswarm::resume_store::ResumeStore;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = Config::load_or_default(&config_path)?;
    logging::init_logging_safe(&config.logging.level);

    match cli.command {
        Commands::Pending => {
            let store = ResumeStore::open(&config.resume_db_path()?)?;
            let pending = store.pending_downloads()?;
            if pending.is_empty() {
                println!("No pending downloads.");
                return Ok(());
            }
            for record in pending {
                println!(
                    "{}  {}  {}/{} bytes  {}",
                    &record.hash[..record.hash.len().min(16)],
                    record.status.as_str(),
                    record.completed_size,
                    record.expected_size,
                    record.url,
                );
            }
        }
        Commands::Cleanup { max_age_hours } => {
            let store = ResumeStore::open(&config.resume_db_path()?)?;
            let max_age = max_age_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or_else(|| config.resume.max_age());
            let removed = store.cleanup_stale(max_age)?;
            println!("Removed {} stale download record(s).", removed);
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::AuditTail { lines } => {
            let logger = AuditLogger::new(config.audit_log_path()?, &config.audit)?;
            let events = logger.tail(lines)?;
            if events.is_empty() {
                println!("No audit events.");
                return Ok(());
            }
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}
