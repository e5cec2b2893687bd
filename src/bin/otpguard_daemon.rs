use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use otpguard::alerting::{AlertDispatcher, AlertQueue};
use otpguard::config::Config;
use otpguard::input::AsyncFileTailer;
use otpguard::models::LoginRequest;
use otpguard::output::{OutputFormat, OutputHandler};
use otpguard::persistence::InMemoryCountCache;
use otpguard::{BackgroundTasks, LoginIntake, SqliteLoginStore};

/// How long in-flight detections may run after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Main daemon entry point for the login risk scoring engine
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Starting otpguard daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    // Setup graceful shutdown signal handling
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        signal.cancel();
    })?;

    // Initialize output handler
    let output_format = OutputFormat::from_str(&config.output.format);
    let output = Arc::new(Mutex::new(OutputHandler::new(
        output_format,
        config.output.file_path.clone(),
    )?));

    let store = SqliteLoginStore::new(&config.storage.db_path)?;
    log::info!("Attempt store opened at {:?}", config.storage.db_path);

    // Alert dispatch runs on its own task, fed by a bounded queue
    let (alert_tx, alert_rx) = AlertDispatcher::create_channel(config.alerting.queue_capacity);
    let dispatcher = tokio::spawn(AlertDispatcher::from_config(&config.alerting).run(alert_rx));

    let background = BackgroundTasks::new();
    let counts = Arc::new(InMemoryCountCache::new());
    let intake = Arc::new(LoginIntake::from_config(
        &config,
        store.clone(),
        counts.clone(),
        background.clone(),
        Some(AlertQueue::new(alert_tx)),
    ));
    log::info!("Detection pipeline initialized");

    let maintenance = tokio::spawn(run_maintenance(store, counts, config.clone(), shutdown.clone()));

    // Attempt feed
    let (request_tx, mut request_rx) = mpsc::channel::<LoginRequest>(1024);
    let mut tailer = AsyncFileTailer::new(config.input.file_path.clone(), config.input.from_start)?;
    let feed_shutdown = shutdown.clone();
    let feed = tokio::spawn(async move {
        if let Err(e) = tailer.run(request_tx, feed_shutdown).await {
            log::error!("Attempt feed stopped: {}", e);
        }
    });
    log::info!("Monitoring attempt feed: {:?}", config.input.file_path);
    log::info!("Daemon running. Press Ctrl+C to stop.");

    // One task per attempt; in-flight work is cancelled only after the grace period
    let in_flight = BackgroundTasks::new();
    let detection_cancel = CancellationToken::new();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = request_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let intake = intake.clone();
        let output = output.clone();
        let cancel = detection_cancel.clone();
        in_flight.spawn("login attempt", async move {
            let result = intake.handle(request, &cancel).await;
            let mut output = output.lock().map_err(|_| "output handler poisoned".to_string())?;
            let written = match &result {
                Ok(response) => output.write_response(response),
                Err(failure) => output.write_failure(failure),
            };
            written.map_err(|e| format!("failed to write response: {}", e))
        });
    }

    // Shutdown: stop intake, let detections finish, then flush side effects
    shutdown.cancel();
    let _ = feed.await;
    if tokio::time::timeout(SHUTDOWN_GRACE, in_flight.drain()).await.is_err() {
        log::warn!("Cancelling {} detection(s) still in flight", in_flight.len());
        detection_cancel.cancel();
        in_flight.drain().await;
    }
    background.drain().await;

    // Dropping the intake closes the alert queue so the dispatcher can finish
    drop(intake);
    if tokio::time::timeout(SHUTDOWN_GRACE, dispatcher).await.is_err() {
        log::warn!("Alert dispatcher did not finish in time");
    }
    let _ = maintenance.await;

    if let Ok(mut output) = output.lock() {
        output.flush()?;
    }
    log::info!("otpguard daemon stopped");
    Ok(())
}

/// Periodically prune attempts older than the retention period and
/// drop expired window counts
async fn run_maintenance(
    store: SqliteLoginStore,
    counts: Arc<InMemoryCountCache>,
    config: Config,
    shutdown: CancellationToken,
) {
    let period = Duration::from_secs(config.storage.prune_interval_seconds.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::days(config.storage.retention_days);
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.prune_older_than(cutoff)).await {
            Ok(Ok(0)) => log::debug!("Maintenance: nothing to prune"),
            Ok(Ok(removed)) => log::info!("Maintenance: pruned {} attempt(s) older than {}", removed, cutoff),
            Ok(Err(e)) => log::error!("Maintenance failed: {}", e),
            Err(e) => log::error!("Maintenance task failed: {}", e),
        }

        let purged = counts.purge_expired();
        if purged > 0 {
            log::debug!("Maintenance: dropped {} expired window count(s)", purged);
        }
    }
}
