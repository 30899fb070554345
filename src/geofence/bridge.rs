//! Geofence event bridge
//!
//! Turns region crossings into session transitions and starts or stops the
//! scanning strategies accordingly.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{GeofenceEvent, GeofenceTransition, Region};
use crate::capability::{CapabilityManager, ScanMode};
use crate::detection::ContinuousScanner;
use crate::models::{AppState, TransitionCause};
use crate::platform::{
    BackgroundFetchStatus, BackgroundGrant, BackgroundScheduler, LocationFix, LocationProvider,
    PlatformProfile,
};
use crate::presence::{PresenceError, PresenceSession, Transition};

/// OS services the bridge drives directly
pub struct BridgePlatform {
    pub scheduler: Arc<dyn BackgroundScheduler>,
    pub grant: Arc<dyn BackgroundGrant>,
    pub location: Arc<dyn LocationProvider>,
}

pub struct GeofenceBridge {
    session: Arc<PresenceSession>,
    scanner: Arc<ContinuousScanner>,
    capabilities: CapabilityManager,
    platform: BridgePlatform,
    region: Region,
    profile: PlatformProfile,
    periodic_interval: Duration,
}

impl GeofenceBridge {
    pub fn new(
        session: Arc<PresenceSession>,
        scanner: Arc<ContinuousScanner>,
        capabilities: CapabilityManager,
        platform: BridgePlatform,
        region: Region,
        profile: PlatformProfile,
        periodic_interval: Duration,
    ) -> Self {
        GeofenceBridge {
            session,
            scanner,
            capabilities,
            platform,
            region,
            profile,
            periodic_interval,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub async fn on_event(&self, event: &GeofenceEvent) -> Result<(), PresenceError> {
        if event.region_id != self.region.identifier {
            log::debug!("Ignoring geofence event for region {}", event.region_id);
            return Ok(());
        }

        match event.transition {
            GeofenceTransition::Enter if self.region.notify_on_enter => {
                self.on_enter().await?;
            }
            GeofenceTransition::Exit if self.region.notify_on_exit => {
                self.on_exit().await?;
            }
            transition => {
                log::debug!("Geofence {:?} notifications are disabled", transition);
            }
        }
        Ok(())
    }

    pub async fn on_enter(&self) -> Result<Option<Transition>, PresenceError> {
        self.enter_with(TransitionCause::GeofenceEnter).await
    }

    pub async fn on_exit(&self) -> Result<Transition, PresenceError> {
        let transition = self.session.exit_area(TransitionCause::GeofenceExit).await?;
        self.stop_scanning();
        Ok(transition)
    }

    /// Restart continuous scanning after the radio came back, if still in the area
    pub async fn resume_scanning(&self) -> Result<(), PresenceError> {
        if !self.session.state()?.is_in_area() || self.scanner.is_active() {
            return Ok(());
        }
        let snapshot = self.capabilities.snapshot().await;
        if self.capabilities.scan_mode(&snapshot) == ScanMode::Continuous {
            if let Err(e) = self.scanner.start().await {
                log::warn!("Could not resume continuous scanning: {}", e);
            }
        }
        Ok(())
    }

    /// Correct the persisted state once at launch
    ///
    /// Catches geofence events that were missed while the process was dead.
    pub async fn reconcile_cold_start(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, PresenceError> {
        let state = self.session.state()?;
        log::info!("Cold start in state {}", state);

        if state != AppState::Outside {
            self.ensure_periodic().await;
        }

        let fix = match state {
            AppState::Outside | AppState::Unconfirmed => self.fresh_fix(now).await,
            _ => None,
        };
        let fix = match fix {
            Some(fix) => fix,
            None => return Ok(None),
        };
        let inside = self.region.contains(&fix);

        match state {
            AppState::Unconfirmed if !inside => {
                log::info!(
                    "Fix {:.0} m from region center, ending stale session",
                    self.region.distance_m(&fix)
                );
                let transition = self.session.exit_area(TransitionCause::ColdStart).await?;
                self.stop_scanning();
                Ok(Some(transition))
            }
            AppState::Outside if inside => self.enter_with(TransitionCause::ColdStart).await,
            _ => Ok(None),
        }
    }

    async fn enter_with(&self, cause: TransitionCause) -> Result<Option<Transition>, PresenceError> {
        let transition = self.session.enter_area(cause).await?;
        if transition.is_none() {
            log::debug!("Enter while already in the area, keeping state");
        }

        if self.profile.requires_background_grant {
            if let Err(e) = self.platform.grant.acquire().await {
                log::warn!("Background execution grant unavailable: {}", e);
            }
        }

        let snapshot = self.capabilities.ensure().await?;
        match self.capabilities.scan_mode(&snapshot) {
            ScanMode::Continuous => {
                if let Err(e) = self.scanner.start().await {
                    log::warn!("Continuous scanning unavailable, relying on periodic task: {}", e);
                }
            }
            ScanMode::PeriodicOnly => {
                log::info!("Periodic-only scanning for this session");
            }
        }

        self.session.report_inside_area().await?;
        self.ensure_periodic().await;
        Ok(transition)
    }

    /// Configure and start the periodic task; a no-op when already running
    async fn ensure_periodic(&self) {
        let scheduler = &self.platform.scheduler;
        if scheduler.is_running() {
            return;
        }
        match scheduler.status().await {
            BackgroundFetchStatus::Available => {}
            status => {
                log::warn!("Background fetch {:?}, periodic task not scheduled", status);
                return;
            }
        }

        if let Err(e) = scheduler.configure(self.periodic_interval).await {
            log::warn!("Failed to configure periodic task: {}", e);
            return;
        }
        match scheduler.start().await {
            Ok(()) => log::info!("Periodic task scheduled every {:?}", self.periodic_interval),
            Err(e) => log::warn!("Failed to start periodic task: {}", e),
        }
    }

    fn stop_scanning(&self) {
        self.platform.scheduler.stop();
        self.scanner.stop();
        self.platform.grant.release();
    }

    async fn fresh_fix(&self, now: DateTime<Utc>) -> Option<LocationFix> {
        match self.platform.location.current_fix().await {
            Ok(Some(fix)) if self.region.is_fresh(&fix, now) => Some(fix),
            Ok(Some(fix)) => {
                log::debug!("Ignoring location fix from {}", fix.timestamp);
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Location unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::AttendanceKind;
    use crate::config::{BeaconConfig, GeofenceConfig, ScannerConfig};
    use crate::persistence::{keys, PresenceStore, SqlitePresenceStore};
    use crate::testing::{
        advertisement, now_minus, session_in, settle, FakeCapabilities, FakeForeground, FakeGrant,
        FakeLocation, FakeRadio, FakeScheduler, RecordingSink,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    const LAT: f64 = 52.5200;
    const LON: f64 = 13.4050;

    struct Harness {
        bridge: GeofenceBridge,
        session: Arc<PresenceSession>,
        scanner: Arc<ContinuousScanner>,
        store: Arc<SqlitePresenceStore>,
        radio: Arc<FakeRadio>,
        scheduler: Arc<FakeScheduler>,
        grant: Arc<FakeGrant>,
        location: Arc<FakeLocation>,
        sink: Arc<RecordingSink>,
    }

    fn harness(state: AppState, profile: PlatformProfile, caps: FakeCapabilities) -> Harness {
        let (session, store, sink) = session_in(state);
        let radio = Arc::new(FakeRadio::default());
        let scheduler = Arc::new(FakeScheduler::default());
        let grant = Arc::new(FakeGrant::default());
        let location = Arc::new(FakeLocation::default());
        let scanner = ContinuousScanner::new(
            session.clone(),
            radio.clone(),
            Arc::new(FakeForeground(AtomicBool::new(true))),
            profile,
            ScannerConfig::default(),
            &BeaconConfig::default(),
        )
        .unwrap();
        let capabilities =
            CapabilityManager::new(Arc::new(caps), scheduler.clone(), store.clone(), profile);
        let region = Region::from_config(&GeofenceConfig {
            identifier: "office".to_string(),
            latitude: LAT,
            longitude: LON,
            radius_m: 150.0,
            ..GeofenceConfig::default()
        });
        let bridge = GeofenceBridge::new(
            session.clone(),
            scanner.clone(),
            capabilities,
            BridgePlatform {
                scheduler: scheduler.clone(),
                grant: grant.clone(),
                location: location.clone(),
            },
            region,
            profile,
            Duration::from_secs(900),
        );
        Harness {
            bridge,
            session,
            scanner,
            store,
            radio,
            scheduler,
            grant,
            location,
            sink,
        }
    }

    fn event(region: &str, transition: GeofenceTransition) -> GeofenceEvent {
        GeofenceEvent {
            region_id: region.to_string(),
            transition,
        }
    }

    fn set_fix(location: &FakeLocation, latitude: f64, age_secs: i64) {
        *location.fix.lock().unwrap() = Some(LocationFix {
            latitude,
            longitude: LON,
            accuracy_m: None,
            timestamp: now_minus(age_secs),
        });
    }

    #[tokio::test]
    async fn test_enter_starts_scanning() {
        let h = harness(AppState::Outside, PlatformProfile::android(), FakeCapabilities::granted());

        h.bridge
            .on_event(&event("office", GeofenceTransition::Enter))
            .await
            .unwrap();

        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
        assert!(h.scanner.is_active());
        assert!(h.grant.held.load(Ordering::SeqCst));
        assert!(h.scheduler.is_running());
        assert_eq!(*h.scheduler.configured.lock().unwrap(), Some(Duration::from_secs(900)));
        assert_eq!(h.sink.count(AttendanceKind::InsideArea), 1);
    }

    #[tokio::test]
    async fn test_redelivered_enter_keeps_presence() {
        let h = harness(AppState::Present, PlatformProfile::generic(), FakeCapabilities::granted());

        let transition = h.bridge.on_enter().await.unwrap();
        h.bridge.on_enter().await.unwrap();

        assert!(transition.is_none());
        assert_eq!(h.session.state().unwrap(), AppState::Present);
        assert_eq!(h.sink.count(AttendanceKind::InsideArea), 0);
        assert_eq!(h.radio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_notifications_falls_back_to_periodic() {
        let h = harness(AppState::Outside, PlatformProfile::android(), FakeCapabilities::denied());

        h.bridge.on_enter().await.unwrap();

        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
        assert!(!h.scanner.is_active());
        assert!(h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_denied_background_fetch_is_not_scheduled() {
        let h = harness(AppState::Outside, PlatformProfile::ios(), FakeCapabilities::granted());
        *h.scheduler.status.lock().unwrap() = BackgroundFetchStatus::Denied;

        h.bridge.on_enter().await.unwrap();

        assert!(h.scanner.is_active());
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_exit_while_present_ends_everything() {
        let h = harness(AppState::InsideArea, PlatformProfile::android(), FakeCapabilities::granted());
        h.bridge.on_enter().await.unwrap();
        h.radio
            .emit(advertisement("AA:BB", "Office-Beacon-1", -50))
            .await;
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);

        h.bridge
            .on_event(&event("office", GeofenceTransition::Exit))
            .await
            .unwrap();

        assert_eq!(h.session.state().unwrap(), AppState::Outside);
        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
        assert!(!h.store.flag(keys::INSIDE_AREA_REPORTED).unwrap());
        assert!(!h.scanner.is_active());
        assert!(!h.scheduler.is_running());
        assert!(!h.grant.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_exit_from_inside_area_posts_one_exit() {
        let h = harness(AppState::Outside, PlatformProfile::generic(), FakeCapabilities::granted());
        h.bridge.on_enter().await.unwrap();

        h.bridge.on_exit().await.unwrap();
        h.bridge.on_exit().await.unwrap();

        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
        assert_eq!(h.session.state().unwrap(), AppState::Outside);
    }

    #[tokio::test]
    async fn test_other_regions_and_muted_transitions_are_ignored() {
        let mut h = harness(AppState::Outside, PlatformProfile::generic(), FakeCapabilities::granted());

        h.bridge
            .on_event(&event("warehouse", GeofenceTransition::Enter))
            .await
            .unwrap();
        assert_eq!(h.session.state().unwrap(), AppState::Outside);

        h.bridge.region.notify_on_enter = false;
        h.bridge
            .on_event(&event("office", GeofenceTransition::Enter))
            .await
            .unwrap();
        assert_eq!(h.session.state().unwrap(), AppState::Outside);
        assert!(!h.scanner.is_active());
    }

    #[tokio::test]
    async fn test_resume_scanning_only_inside_area() {
        let h = harness(AppState::Outside, PlatformProfile::generic(), FakeCapabilities::granted());
        h.bridge.resume_scanning().await.unwrap();
        assert!(!h.scanner.is_active());

        let h = harness(AppState::Present, PlatformProfile::generic(), FakeCapabilities::granted());
        h.bridge.resume_scanning().await.unwrap();
        assert!(h.scanner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_ends_stale_session_outside_radius() {
        let h = harness(AppState::Present, PlatformProfile::generic(), FakeCapabilities::granted());
        h.store
            .set_timestamp(keys::ENTER_SENT_AT, Some(now_minus(3600)))
            .unwrap();
        h.scanner.start().await.unwrap();
        for _ in 0..4 {
            assert!(h.radio.emit(advertisement("AA:BB", "Office-Beacon-1", -85)).await);
        }
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::Unconfirmed);
        assert!(h.session.debounce_armed().await);
        set_fix(&h.location, LAT + 0.01, 30);

        let transition = h.bridge.reconcile_cold_start(Utc::now()).await.unwrap().unwrap();

        assert_eq!((transition.from, transition.to), (AppState::Unconfirmed, AppState::Outside));
        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
        assert!(h.store.record().unwrap().enter_sent_at.is_none());
        assert!(!h.scheduler.is_running());
        assert!(!h.scanner.is_active());
        assert_eq!(h.radio.stops.load(Ordering::SeqCst), 1);
        assert!(!h.session.debounce_armed().await);

        // Nothing left behind fires later
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.session.state().unwrap(), AppState::Outside);
        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
    }

    #[tokio::test]
    async fn test_cold_start_ignores_stale_or_inside_fix() {
        let h = harness(AppState::Unconfirmed, PlatformProfile::generic(), FakeCapabilities::granted());

        set_fix(&h.location, LAT + 0.01, 900);
        assert!(h.bridge.reconcile_cold_start(Utc::now()).await.unwrap().is_none());

        set_fix(&h.location, LAT, 10);
        assert!(h.bridge.reconcile_cold_start(Utc::now()).await.unwrap().is_none());

        assert_eq!(h.session.state().unwrap(), AppState::Unconfirmed);
        assert!(h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_cold_start_inside_radius_enters_area() {
        let h = harness(AppState::Outside, PlatformProfile::generic(), FakeCapabilities::granted());
        set_fix(&h.location, LAT, 10);

        let transition = h.bridge.reconcile_cold_start(Utc::now()).await.unwrap().unwrap();

        assert_eq!(transition.to, AppState::InsideArea);
        assert_eq!(transition.cause, TransitionCause::ColdStart);
        assert!(h.scanner.is_active());
    }

    #[tokio::test]
    async fn test_cold_start_outside_without_fix_does_nothing() {
        let h = harness(AppState::Outside, PlatformProfile::generic(), FakeCapabilities::granted());
        assert!(h.bridge.reconcile_cold_start(Utc::now()).await.unwrap().is_none());
        assert!(!h.scheduler.is_running());
    }
}
