use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use beacon_presence::attendance::AttendanceReporter;
use beacon_presence::config::Config;
use beacon_presence::input::{AsyncFileTailer, AsyncUdpListener, PlatformEvent};
use beacon_presence::output::{OutputFormat, OutputHandler};
use beacon_presence::persistence::{PresenceStore, SqlitePresenceStore};
use beacon_presence::PresenceApp;

/// Main daemon entry point for beacon presence detection
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting presence daemon...");

    // Load configuration
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

    // Setup graceful shutdown signal handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let store: Arc<dyn PresenceStore> = Arc::new(SqlitePresenceStore::new(&config.store.path)?);
    log::info!("Presence store opened at {:?}", config.store.path);

    if let Some(ref user_id) = config.attendance.user_id {
        if store.user_id()?.is_none() {
            store.set_user_id(Some(user_id.as_str()))?;
            log::info!("Seeded user identifier from configuration");
        }
    }

    let cutoff = Utc::now() - chrono::Duration::days(config.store.history_retention_days);
    let pruned = store.prune_transitions(cutoff)?;
    if pruned > 0 {
        log::info!("Pruned {} transitions older than {}", pruned, cutoff);
    }

    let reporter = Arc::new(AttendanceReporter::new(config.attendance.clone(), store.clone()));
    let (app, mut wakeups) = PresenceApp::build(&config, store, reporter)?;
    let app = Arc::new(app);
    log::info!(
        "Presence detection initialized (state {})",
        app.session().state()?
    );

    // Journal every committed transition
    let output_format = OutputFormat::parse(&config.output.format);
    let mut output_handler = OutputHandler::new(output_format, config.output.file_path.clone())?;
    let mut changes = app.session().subscribe();
    let journal = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(e) = output_handler.write_change(&change) {
                        log::error!("Failed to write journal entry: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Journal lagged, {} transitions not written", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        if let Err(e) = output_handler.flush() {
            log::error!("Failed to flush journal: {}", e);
        }
    });

    // Initialize input source
    let (event_tx, mut events) = mpsc::channel::<PlatformEvent>(256);
    match config.input.source_type.as_str() {
        "file" => {
            if let Some(ref path) = config.input.file_path {
                let mut tailer = AsyncFileTailer::new(path.clone());
                log::info!("Following event file: {:?}", path);
                tokio::spawn(async move {
                    if let Err(e) = tailer.run(event_tx).await {
                        log::error!("Event file tailer stopped: {}", e);
                    }
                });
            }
        }
        "udp" => {
            if let Some(ref address) = config.input.udp_address {
                let mut listener = AsyncUdpListener::new(address).await?;
                log::info!("Listening for events on {}", address);
                tokio::spawn(async move {
                    if let Err(e) = listener.run(event_tx).await {
                        log::error!("UDP listener stopped: {}", e);
                    }
                });
            }
        }
        _ => {
            log::warn!("Unknown input source type: {}", config.input.source_type);
        }
    }

    if let Err(e) = app.bridge().reconcile_cold_start(Utc::now()).await {
        log::error!("Cold-start reconciliation failed: {}", e);
    }

    log::info!("Daemon running. Press Ctrl+C to stop.");

    let mut shutdown_poll = tokio::time::interval(Duration::from_millis(100));
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some(event) = events.recv() => {
                if let Err(e) = app.handle_event(event).await {
                    log::error!("Error handling platform event: {}", e);
                }
            }
            Some(invocation) = wakeups.recv() => {
                let app = app.clone();
                tokio::spawn(async move {
                    let result = app.on_wake(invocation).await;
                    log::debug!("Periodic invocation {:?} finished: {:?}", invocation, result);
                });
            }
            _ = shutdown_poll.tick() => {}
        }
    }

    app.shutdown();
    drop(app);
    // The session's change channel closes once every handle is gone
    if tokio::time::timeout(Duration::from_secs(1), journal).await.is_err() {
        log::debug!("Journal still subscribed at shutdown");
    }

    log::info!("Presence daemon stopped");
    Ok(())
}
