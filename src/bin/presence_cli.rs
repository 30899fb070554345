use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structopt::StructOpt;

use beacon_presence::config::Config;
use beacon_presence::detection::{PeriodicOutcome, PeriodicTask};
use beacon_presence::host::ReplayRadio;
use beacon_presence::input::{EventFileReader, PlatformEvent};
use beacon_presence::output::{OutputFormat, OutputHandler};
use beacon_presence::persistence::{PresenceStore, SqlitePresenceStore};

/// Beacon presence command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "presence", about = "Beacon presence detection CLI")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Show the persisted presence state
    Status {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Show recent state transitions
    History {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Number of transitions to show
        #[structopt(short, long, default_value = "20")]
        limit: usize,
        /// Output format: console, json or jsonl
        #[structopt(short, long, default_value = "console")]
        format: String,
    },
    /// Set or clear the user identifier used for attendance reports
    SetUser {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// User identifier; omit to clear it
        user_id: Option<String>,
    },
    /// Reset all persisted presence data
    Reset {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Parse and display platform events from a file
    Parse {
        /// Path to event file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of events to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
    },
    /// Run one periodic invocation against recorded advertisements
    Wake {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Event file whose advertisements the scan will see
        #[structopt(short, long)]
        events: Option<PathBuf>,
    },
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        eprintln!("Configuration file not found: {:?}, using defaults", path);
        Ok(Config::default())
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn PresenceStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(SqlitePresenceStore::new(&config.store.path)?))
}

fn read_events(file: &Path) -> Result<Vec<PlatformEvent>, Box<dyn std::error::Error>> {
    if !file.exists() {
        eprintln!("File not found: {:?}", file);
        std::process::exit(1);
    }
    Ok(EventFileReader::new(file.to_path_buf()).read_events()?)
}

fn describe(event: &PlatformEvent) -> String {
    match event {
        PlatformEvent::Geofence(g) => {
            format!("Geofence: region {}, transition {:?}", g.region_id, g.transition)
        }
        PlatformEvent::Advertisement(a) => format!(
            "Advertisement: device {}, name {}, rssi {}",
            a.device_id,
            a.name.as_deref().unwrap_or("-"),
            a.rssi
        ),
        PlatformEvent::Location(fix) => format!(
            "Location: {:.6},{:.6} at {}",
            fix.latitude, fix.longitude, fix.timestamp
        ),
        PlatformEvent::Foreground { foreground } => format!("Foreground: {}", foreground),
        PlatformEvent::Radio { powered } => format!("Radio powered: {}", powered),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Status { config } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            let record = store.record()?;
            let fmt_time = |t: Option<chrono::DateTime<Utc>>| {
                t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            };

            println!("State:                {}", store.app_state()?);
            println!(
                "User:                 {}",
                store.user_id()?.unwrap_or_else(|| "(not set)".to_string())
            );
            println!("Last seen:            {}", fmt_time(record.last_seen_at));
            println!("Enter reported:       {}", fmt_time(record.enter_sent_at));
            println!("Inside area reported: {}", record.inside_area_reported);
            println!("Last scan attempt:    {}", fmt_time(record.last_scan_attempt_at));
            println!("Failure streak:       {}", record.scan_failure_streak);
            println!("Retry suppressed to:  {}", fmt_time(record.rapid_retry_until));
            if let Some(device) = record.last_device {
                println!(
                    "Last beacon:          {} ({})",
                    device.id,
                    device.name.as_deref().unwrap_or("-")
                );
            }
        }
        Cli::History {
            config,
            limit,
            format,
        } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            let mut changes = store.recent_transitions(limit)?;
            // Oldest first reads naturally on a terminal
            changes.reverse();

            let mut output = OutputHandler::new(OutputFormat::parse(&format), None)?;
            for change in &changes {
                output.write_change(change)?;
            }
            output.flush()?;
        }
        Cli::SetUser { config, user_id } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            store.set_user_id(user_id.as_deref())?;
            match user_id {
                Some(id) => println!("User identifier set to {}", id),
                None => println!("User identifier cleared"),
            }
        }
        Cli::Reset { config } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            store.clear_all()?;
            println!("Presence data reset; state is {}", store.app_state()?);
        }
        Cli::Parse { file, lines } => {
            let events = read_events(&file)?;
            let display_count = std::cmp::min(lines, events.len());

            println!("Parsed {} event(s) (showing {}):\n", events.len(), display_count);
            for event in events.iter().take(display_count) {
                println!("  {}", describe(event));
            }
        }
        Cli::Wake { config, events } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;

            let recorded = match events {
                Some(file) => read_events(&file)?
                    .into_iter()
                    .filter_map(|event| match event {
                        PlatformEvent::Advertisement(adv) => Some(adv),
                        _ => None,
                    })
                    .collect(),
                None => Vec::new(),
            };
            println!("Replaying {} advertisement(s)", recorded.len());

            let task = PeriodicTask::headless(&config, store, Arc::new(ReplayRadio::new(recorded)))?;
            let runtime = tokio::runtime::Runtime::new()?;
            let run = runtime.block_on(task.run_at(Utc::now()))?;

            if let Some(expired) = run.expired {
                println!("Expired stale presence: {} -> {}", expired.from, expired.to);
            }
            if run.inside_area_reported {
                println!("Reported inside-area status");
            }
            match run.outcome {
                PeriodicOutcome::Skipped(reason) => println!("Scan skipped: {:?}", reason),
                PeriodicOutcome::Found(detection) => println!(
                    "Beacon found: {} at {} dBm",
                    detection.device_id, detection.rssi
                ),
                PeriodicOutcome::NotFound => println!("No beacon found"),
                PeriodicOutcome::RadioFailed(e) => println!("Radio failed: {}", e),
            }
            println!("State: {}", task.session().state()?);
        }
    }

    Ok(())
}
