use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

use otpguard::alerting::{AlertDispatcher, AlertQueue};
use otpguard::config::Config;
use otpguard::input::FileTailer;
use otpguard::output::{OutputFormat, OutputHandler};
use otpguard::persistence::InMemoryCountCache;
use otpguard::{BackgroundTasks, LoginIntake, SqliteLoginStore};

/// otpguard command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "otpguard", about = "Login risk scoring for OTP phishing detection")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Validate a configuration file and the resources it points at
    Check {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Score the attempts in a feed file against the configured store
    Score {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Attempt file (JSON lines or key=value lines)
        #[structopt(short, long)]
        file: PathBuf,
        /// Output format: json, jsonl or console
        #[structopt(long, default_value = "console")]
        format: String,
    },
    /// List the most recent attempts flagged as phishing risk
    Recent {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Number of attempts to show
        #[structopt(short, long, default_value = "10")]
        limit: usize,
    },
    /// Delete attempts older than the retention period
    Prune {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Override the configured retention, in days
        #[structopt(short, long)]
        days: Option<i64>,
    },
}

fn load_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Config::from_file(path)
    } else {
        eprintln!("Configuration file not found: {:?}, using defaults", path);
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Check { config } => {
            if !config.exists() {
                eprintln!("Configuration file not found: {:?}", config);
                eprintln!("Run 'otpguard config' to generate a default configuration");
                std::process::exit(1);
            }
            let config = Config::from_file(&config)?;
            let detection = &config.detection;
            println!("Configuration loaded successfully");
            println!("  Phishing threshold:   > {}", detection.phishing_threshold);
            println!("  History limit:        {}", detection.history_limit);
            println!("  Network window:       {} min", detection.network_window_minutes);
            println!("  Collaborator timeout: {} ms", detection.collaborator_timeout_ms);
            println!("  Lookup failures:      {:?}", detection.lookup_failure_policy);

            let store = SqliteLoginStore::new(&config.storage.db_path)?;
            println!("  Attempt store:        {:?} ({} attempts)", config.storage.db_path, store.count_all()?);

            match &config.geolocation.geoip_db_path {
                Some(path) if path.exists() => println!("  GeoIP database:       {:?}", path),
                Some(path) => println!("  GeoIP database:       {:?} (missing, country lookup disabled)", path),
                None => println!("  GeoIP database:       not configured"),
            }
            if config.reputation.abuseipdb_api_key.is_none() {
                println!("  Warning: no AbuseIPDB API key, IP reputation will be unknown");
            }
            if config.reputation.vpn_ranges.is_empty() {
                println!("  Warning: no VPN ranges configured");
            }
        }
        Cli::Score { config, file, format } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }
            let config = load_config(&config)?;
            let store = SqliteLoginStore::new(&config.storage.db_path)?;

            let (alert_tx, alert_rx) = AlertDispatcher::create_channel(config.alerting.queue_capacity);
            let dispatcher = tokio::spawn(AlertDispatcher::from_config(&config.alerting).run(alert_rx));
            let background = BackgroundTasks::new();
            let intake = LoginIntake::from_config(
                &config,
                store,
                Arc::new(InMemoryCountCache::new()),
                background.clone(),
                Some(AlertQueue::new(alert_tx)),
            );

            let mut tailer = FileTailer::new(file, true)?;
            let requests = tailer.read_requests()?;
            let mut output = OutputHandler::new(OutputFormat::from_str(&format), None)?;

            let cancel = CancellationToken::new();
            let (mut flagged, mut failed) = (0, 0);
            for request in requests {
                match intake.handle(request, &cancel).await {
                    Ok(response) => {
                        if response.is_phishing {
                            flagged += 1;
                        }
                        output.write_response(&response)?;
                    }
                    Err(failure) => {
                        failed += 1;
                        output.write_failure(&failure)?;
                    }
                }
            }

            background.drain().await;
            drop(intake);
            let _ = dispatcher.await;
            eprintln!("{} flagged, {} failed", flagged, failed);
        }
        Cli::Recent { config, limit } => {
            let config = load_config(&config)?;
            let store = SqliteLoginStore::new(&config.storage.db_path)?;
            let attempts = store.recent_flagged(limit)?;

            println!("{} flagged attempt(s):\n", attempts.len());
            for attempt in attempts {
                println!(
                    "  [{}] User: {}, IP: {}, Device: {}, Location: {}, Score: {}",
                    attempt.created_at.format("%Y-%m-%d %H:%M:%S"),
                    attempt.user_id,
                    attempt.ip_address,
                    attempt.device_id,
                    attempt.location,
                    attempt.risk_score
                );
            }
        }
        Cli::Prune { config, days } => {
            let config = load_config(&config)?;
            let store = SqliteLoginStore::new(&config.storage.db_path)?;
            let days = days.unwrap_or(config.storage.retention_days);
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
            let removed = store.prune_older_than(cutoff)?;
            println!("Removed {} attempt(s) older than {} days", removed, days);
        }
    }

    Ok(())
}
