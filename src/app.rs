//! Wiring of the presence core onto the host adapters

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::attendance::AttendanceSink;
use crate::capability::CapabilityManager;
use crate::config::{Config, ConfigError};
use crate::detection::{ContinuousScanner, PeriodicTask, ScanError, ScanFilter};
use crate::geofence::bridge::BridgePlatform;
use crate::geofence::{GeofenceBridge, Region};
use crate::host::{
    ChannelRadio, ForegroundFlag, IntervalScheduler, LatestFixLocation, LoggingGrant,
    StaticCapabilities,
};
use crate::input::PlatformEvent;
use crate::persistence::PresenceStore;
use crate::platform::{BackgroundScheduler, InvocationId, TaskResult};
use crate::presence::{PresenceError, PresenceSession, Thresholds};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scanner error: {0}")]
    Scan(#[from] ScanError),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),
}

/// Everything a daemon host needs, built once at startup
pub struct PresenceApp {
    session: Arc<PresenceSession>,
    scanner: Arc<ContinuousScanner>,
    bridge: GeofenceBridge,
    periodic: PeriodicTask,
    scheduler: Arc<IntervalScheduler>,
    radio: Arc<ChannelRadio>,
    location: Arc<LatestFixLocation>,
    foreground: Arc<ForegroundFlag>,
}

impl PresenceApp {
    /// Build the app; wake-ups from the periodic scheduler arrive on the receiver
    pub fn build(
        config: &Config,
        store: Arc<dyn PresenceStore>,
        sink: Arc<dyn AttendanceSink>,
    ) -> Result<(Self, mpsc::Receiver<InvocationId>), AppError> {
        config.validate()?;
        let profile = config.platform.resolve()?;
        let session = PresenceSession::open(store.clone(), sink)?;

        let radio = Arc::new(ChannelRadio::new(true));
        let location = Arc::new(LatestFixLocation::default());
        let foreground = Arc::new(ForegroundFlag::new(config.host.start_in_foreground));
        let (scheduler, wakeups) =
            IntervalScheduler::new(config.periodic.interval(), config.host.background_fetch);
        let scheduler = Arc::new(scheduler);

        let scanner = ContinuousScanner::new(
            session.clone(),
            radio.clone(),
            foreground.clone(),
            profile,
            config.scanner.clone(),
            &config.beacon,
        )?;

        let capabilities = CapabilityManager::new(
            Arc::new(StaticCapabilities::from_config(&config.host)),
            scheduler.clone(),
            store,
            profile,
        );
        let bridge = GeofenceBridge::new(
            session.clone(),
            scanner.clone(),
            capabilities,
            BridgePlatform {
                scheduler: scheduler.clone(),
                grant: Arc::new(LoggingGrant::default()),
                location: location.clone(),
            },
            Region::from_config(&config.geofence),
            profile,
            config.periodic.interval(),
        );

        let filter = ScanFilter::from_config(&config.beacon).map_err(ScanError::from)?;
        let thresholds = scanner.thresholds();
        let periodic = PeriodicTask::new(
            session.clone(),
            radio.clone(),
            profile,
            filter,
            thresholds,
            config.periodic.clone(),
        )
        .with_scanner(scanner.clone());

        let app = PresenceApp {
            session,
            scanner,
            bridge,
            periodic,
            scheduler,
            radio,
            location,
            foreground,
        };
        Ok((app, wakeups))
    }

    pub fn session(&self) -> &Arc<PresenceSession> {
        &self.session
    }

    pub fn scanner(&self) -> &Arc<ContinuousScanner> {
        &self.scanner
    }

    pub fn bridge(&self) -> &GeofenceBridge {
        &self.bridge
    }

    pub fn thresholds(&self) -> Thresholds {
        self.scanner.thresholds()
    }

    /// Apply one host event
    pub async fn handle_event(&self, event: PlatformEvent) -> Result<(), AppError> {
        match event {
            PlatformEvent::Geofence(event) => self.bridge.on_event(&event).await?,
            PlatformEvent::Advertisement(adv) => {
                if !self.radio.deliver(adv) {
                    log::trace!("Advertisement received while no scan is running");
                }
            }
            PlatformEvent::Location(fix) => self.location.update(fix),
            PlatformEvent::Foreground { foreground } => {
                log::debug!("Foreground: {}", foreground);
                self.foreground.set(foreground);
            }
            PlatformEvent::Radio { powered } => {
                log::info!("Radio powered {}", if powered { "on" } else { "off" });
                self.radio.set_powered(powered);
                if powered {
                    self.bridge.resume_scanning().await?;
                } else {
                    self.scanner.stop();
                }
            }
        }
        Ok(())
    }

    /// Run the periodic task for one scheduler wake-up
    pub async fn on_wake(&self, invocation: InvocationId) -> TaskResult {
        self.periodic.on_wake(self.scheduler.as_ref(), invocation).await
    }

    /// Stop all scanning without touching the persisted state
    pub fn shutdown(&self) {
        self.scanner.stop();
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{PeriodicOutcome, SkipReason};
    use crate::models::AppState;
    use crate::persistence::SqlitePresenceStore;
    use crate::testing::{advertisement, settle, RecordingSink};

    fn app_in(state: AppState) -> Arc<PresenceApp> {
        let store = Arc::new(SqlitePresenceStore::in_memory().unwrap());
        store.set_app_state(state).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (app, _wakeups) = PresenceApp::build(&Config::default(), store, sink).unwrap();
        Arc::new(app)
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_returning_mid_wake_keeps_continuous_scan_alive() {
        let app = app_in(AppState::InsideArea);
        app.handle_event(PlatformEvent::Radio { powered: false }).await.unwrap();

        // A periodic invocation waits for the radio
        let waker = app.clone();
        let wake = tokio::spawn(async move { waker.on_wake(InvocationId(1)).await });
        settle().await;

        // Power comes back and continuous scanning resumes first
        app.handle_event(PlatformEvent::Radio { powered: true }).await.unwrap();
        assert!(app.scanner().is_active());
        wake.await.unwrap();

        assert!(app.scanner().is_active());
        for _ in 0..3 {
            app.handle_event(PlatformEvent::Advertisement(advertisement(
                "AA:BB",
                "Office-Beacon-1",
                -50,
            )))
            .await
            .unwrap();
        }
        settle().await;
        assert_eq!(app.session().state().unwrap(), AppState::Present);

        let run = app.periodic.run_at(chrono::Utc::now()).await.unwrap();
        assert_eq!(run.outcome, PeriodicOutcome::Skipped(SkipReason::ScannerActive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_power_loss_stops_scanner() {
        let app = app_in(AppState::InsideArea);
        app.bridge().resume_scanning().await.unwrap();
        assert!(app.scanner().is_active());

        app.handle_event(PlatformEvent::Radio { powered: false }).await.unwrap();
        assert!(!app.scanner().is_active());
        assert_eq!(app.session().state().unwrap(), AppState::InsideArea);
    }
}
