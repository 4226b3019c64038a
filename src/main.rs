use memcache_check::config::Config;
use memcache_check::{CacheHealthCheck, Report, TextClient};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.check.host(),
        port = config.check.port(),
        timeout_ms = config.timeout.as_millis() as u64,
        "Checking memcache server"
    );

    let timeout = config.timeout;
    let check = CacheHealthCheck::with_client(config.check, move || TextClient::new(timeout))
        .with_label(config.label);

    let report = Report::run(&check);
    println!("{}", report);

    if report.outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
