use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use smbguard::alerting::{AlertDispatcher, AlertQueue};
use smbguard::config::Config;
use smbguard::service::GuardService;

/// How long shutdown waits for a running scan
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Daemon entry point: scheduled scans until Ctrl+C
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting smbguard daemon...");

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };

    let runtime = tokio::runtime::Runtime::new()?;

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        signal.notify_one();
    })?;

    let (alerts, dispatcher) = if config.alerting.enabled {
        let (tx, rx) = AlertDispatcher::create_channel();
        let task = runtime.spawn(AlertDispatcher::new(config.alerting.clone()).run(rx));
        (Some(AlertQueue::new(tx)), Some(task))
    } else {
        (None, None)
    };

    let service = GuardService::from_config(&config, runtime.handle().clone(), alerts)?;
    service.start();

    log::info!(
        "Scanning {} every {} minute(s), ban threshold {}",
        config.input.file_path.display(),
        config.scan.interval_minutes,
        config.scan.threshold
    );
    log::info!("Daemon running. Press Ctrl+C to stop.");

    runtime.block_on(async {
        shutdown.notified().await;
        if !service.shutdown(SHUTDOWN_GRACE).await {
            log::warn!("Exiting with a scan still in progress");
        }
    });

    // Dropping the service closes the alert queue so the dispatcher drains
    drop(service);
    if let Some(task) = dispatcher {
        runtime.block_on(async {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log::warn!("Alert dispatcher did not drain in time");
            }
        });
    }

    log::info!("smbguard daemon stopped");
    Ok(())
}
