//! Continuous beacon scanning
//!
//! Runs while the user is inside the geofence. One pump task consumes the
//! radio's advertisement channel in arrival order, smooths RSSI per device
//! and feeds the session; a watchdog task downgrades the session when the
//! beacon has gone silent for too long.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::filter::ScanFilter;
use super::rssi_window::RssiWindows;
use super::ScanError;
use crate::config::{BeaconConfig, ScannerConfig};
use crate::models::{Advertisement, AppState, Detection, TransitionCause};
use crate::platform::{ForegroundStatus, PlatformError, PlatformProfile, RadioScanner};
use crate::presence::{PresenceSession, Thresholds};

const DETECTION_CHANNEL_CAPACITY: usize = 128;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the pump and the watchdog of one scan
struct ScanShared {
    live: AtomicBool,
    windows: Mutex<RssiWindows>,
    last_accepted: Mutex<Instant>,
}

struct ActiveScan {
    shared: Arc<ScanShared>,
    pump: JoinHandle<()>,
    watchdog: JoinHandle<()>,
    /// Held for as long as the scan runs
    _lease: OwnedMutexGuard<()>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveScan>>>;

/// Exclusive use of the radio's scan
///
/// Only the holder may start or stop a scan. The continuous scanner keeps
/// it for the whole session; a periodic scan only takes it when free.
pub type RadioLease = Arc<tokio::sync::Mutex<()>>;

/// Foreground-capable scanner feeding the presence session
pub struct ContinuousScanner {
    session: Arc<PresenceSession>,
    radio: Arc<dyn RadioScanner>,
    foreground: Arc<dyn ForegroundStatus>,
    profile: PlatformProfile,
    config: ScannerConfig,
    filter: ScanFilter,
    thresholds: Thresholds,
    active: ActiveSlot,
    radio_lease: RadioLease,
    /// Serializes concurrent `start` calls
    starting: tokio::sync::Mutex<()>,
    detections: broadcast::Sender<Detection>,
}

impl ContinuousScanner {
    pub fn new(
        session: Arc<PresenceSession>,
        radio: Arc<dyn RadioScanner>,
        foreground: Arc<dyn ForegroundStatus>,
        profile: PlatformProfile,
        config: ScannerConfig,
        beacon: &BeaconConfig,
    ) -> Result<Arc<Self>, ScanError> {
        let filter = ScanFilter::from_config(beacon)?;
        let thresholds = Thresholds::new(beacon.enter_threshold, beacon.exit_threshold).ok_or(
            ScanError::InvalidThresholds {
                enter: beacon.enter_threshold,
                exit: beacon.exit_threshold,
            },
        )?;
        let (detections, _) = broadcast::channel(DETECTION_CHANNEL_CAPACITY);

        Ok(Arc::new(ContinuousScanner {
            session,
            radio,
            foreground,
            profile,
            config,
            filter,
            thresholds,
            active: Arc::new(Mutex::new(None)),
            radio_lease: Arc::new(tokio::sync::Mutex::new(())),
            starting: tokio::sync::Mutex::new(()),
            detections,
        }))
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Every accepted detection, before smoothing
    pub fn subscribe_detections(&self) -> broadcast::Receiver<Detection> {
        self.detections.subscribe()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn radio_lease(&self) -> RadioLease {
        self.radio_lease.clone()
    }

    /// Start scanning; a second call while active is a no-op
    pub async fn start(&self) -> Result<(), ScanError> {
        let _guard = self.starting.lock().await;
        if self.is_active() {
            log::debug!("Continuous scanner already active");
            return Ok(());
        }

        match tokio::time::timeout(self.config.ready_timeout(), self.radio.wait_ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ScanError::Platform(e)),
            Err(_) => return Err(ScanError::NotReady(self.config.ready_timeout())),
        }

        // A periodic scan holding the radio ends within its own timeout
        let lease = self.radio_lease.clone().lock_owned().await;

        let native_filtering =
            self.foreground.is_foreground() || self.profile.can_filter_by_service_while_backgrounded;
        let request = self.filter.scan_request(native_filtering);
        let receiver = self.radio.start_scan(request).await?;

        let shared = Arc::new(ScanShared {
            live: AtomicBool::new(true),
            windows: Mutex::new(RssiWindows::with_capacity(self.config.window_size)),
            last_accepted: Mutex::new(Instant::now()),
        });
        let pump = tokio::spawn(pump(
            receiver,
            shared.clone(),
            self.active.clone(),
            self.radio.clone(),
            self.session.clone(),
            self.filter.clone(),
            self.thresholds,
            self.config.debounce(),
            self.detections.clone(),
        ));
        let watchdog = tokio::spawn(watchdog(
            shared.clone(),
            self.session.clone(),
            self.foreground.clone(),
            self.profile.suppresses_background_scan_callbacks,
            self.config.watchdog_interval(),
            self.config.watchdog_timeout(),
        ));

        let mut slot = lock(&self.active);
        if !shared.live.load(Ordering::SeqCst) {
            // The radio ended the scan before it was registered
            drop(slot);
            watchdog.abort();
            self.radio.stop_scan();
            return Err(ScanError::Platform(PlatformError::ScanStart(
                "scan ended immediately".to_string(),
            )));
        }
        *slot = Some(ActiveScan {
            shared,
            pump,
            watchdog,
            _lease: lease,
        });
        log::info!("Continuous scanner started");
        Ok(())
    }

    /// Stop scanning; stopping an inactive scanner is a no-op
    pub fn stop(&self) {
        let active = match lock(&self.active).take() {
            Some(active) => active,
            None => return,
        };

        active.shared.live.store(false, Ordering::SeqCst);
        active.pump.abort();
        active.watchdog.abort();
        lock(&active.shared.windows).clear();
        self.radio.stop_scan();
        log::info!("Continuous scanner stopped");
    }
}

impl Drop for ContinuousScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(
    mut receiver: mpsc::Receiver<Advertisement>,
    shared: Arc<ScanShared>,
    slot: ActiveSlot,
    radio: Arc<dyn RadioScanner>,
    session: Arc<PresenceSession>,
    filter: ScanFilter,
    thresholds: Thresholds,
    debounce: Duration,
    detections: broadcast::Sender<Detection>,
) {
    while let Some(adv) = receiver.recv().await {
        if !shared.live.load(Ordering::SeqCst) {
            break;
        }
        if !filter.matches(&adv) {
            continue;
        }

        let detection = Detection::from_advertisement(&adv, Utc::now());
        *lock(&shared.last_accepted) = Instant::now();
        let smoothed = lock(&shared.windows).push(&detection.device_id, detection.rssi);
        log::debug!(
            "Beacon {} rssi {} smoothed {:.1}",
            detection.device_id,
            detection.rssi,
            smoothed
        );
        let _ = detections.send(detection.clone());

        if let Err(e) = session
            .on_detection(&detection, smoothed, &thresholds, debounce, &shared.live)
            .await
        {
            log::warn!("Failed to process detection from {}: {}", detection.device_id, e);
        }
    }
    log::debug!("Advertisement channel closed");

    // Still live means nobody called stop: the radio ended the scan itself
    if !shared.live.swap(false, Ordering::SeqCst) {
        return;
    }
    let ended = {
        let mut slot = lock(&slot);
        match slot.as_ref() {
            Some(active) if Arc::ptr_eq(&active.shared, &shared) => slot.take(),
            _ => None,
        }
    };
    lock(&shared.windows).clear();
    if let Some(active) = ended {
        active.watchdog.abort();
        radio.stop_scan();
        log::warn!("Radio ended the scan, continuous scanner stopped");
    }
}

async fn watchdog(
    shared: Arc<ScanShared>,
    session: Arc<PresenceSession>,
    foreground: Arc<dyn ForegroundStatus>,
    suppresses_background_callbacks: bool,
    period: Duration,
    timeout: Duration,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut suppressed = false;

    loop {
        ticks.tick().await;
        if !shared.live.load(Ordering::SeqCst) {
            break;
        }

        if suppresses_background_callbacks && !foreground.is_foreground() {
            if !suppressed {
                log::debug!("Watchdog paused while backgrounded");
            }
            suppressed = true;
            continue;
        }
        if suppressed {
            // Callbacks were withheld, silence while backgrounded is not evidence
            suppressed = false;
            *lock(&shared.last_accepted) = Instant::now();
            continue;
        }

        let silent_for = lock(&shared.last_accepted).elapsed();
        if silent_for < timeout {
            continue;
        }

        match session.state() {
            Ok(AppState::Present) | Ok(AppState::Unconfirmed) => {
                log::info!("No beacon for {:?}, dropping presence", silent_for);
                match session.force_downgrade(TransitionCause::Watchdog).await {
                    Ok(_) => lock(&shared.windows).clear(),
                    Err(e) => log::warn!("Watchdog downgrade failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Watchdog could not read state: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::AttendanceKind;
    use crate::testing::{advertisement, session_in, settle, FakeForeground, FakeRadio, RecordingSink};
    use crate::persistence::SqlitePresenceStore;

    struct Harness {
        scanner: Arc<ContinuousScanner>,
        session: Arc<PresenceSession>,
        radio: Arc<FakeRadio>,
        foreground: Arc<FakeForeground>,
        sink: Arc<RecordingSink>,
        _store: Arc<SqlitePresenceStore>,
    }

    fn harness(state: AppState, profile: PlatformProfile, in_foreground: bool) -> Harness {
        harness_with(state, profile, in_foreground, BeaconConfig::default())
    }

    fn harness_with(
        state: AppState,
        profile: PlatformProfile,
        in_foreground: bool,
        beacon: BeaconConfig,
    ) -> Harness {
        let (session, store, sink) = session_in(state);
        let radio = Arc::new(FakeRadio::default());
        let foreground = Arc::new(FakeForeground(AtomicBool::new(in_foreground)));
        let scanner = ContinuousScanner::new(
            session.clone(),
            radio.clone(),
            foreground.clone(),
            profile,
            ScannerConfig::default(),
            &beacon,
        )
        .unwrap();
        Harness {
            scanner,
            session,
            radio,
            foreground,
            sink,
            _store: store,
        }
    }

    async fn emit_all(radio: &FakeRadio, samples: &[i16]) {
        for &rssi in samples {
            assert!(radio.emit(advertisement("AA:BB", "Office-Beacon-1", rssi)).await);
        }
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_strong_signal_confirms_presence_once() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();

        emit_all(&h.radio, &[-55]).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);

        emit_all(&h.radio, &[-58, -60, -59, -57]).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);
        assert_eq!(h.sink.count(AttendanceKind::Enter), 1);
        assert!(h.session.record().unwrap().last_seen_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_signal_debounces_to_inside_area() {
        let h = harness(AppState::Present, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();

        emit_all(&h.radio, &[-85, -85, -85, -85]).await;
        assert_eq!(h.session.state().unwrap(), AppState::Unconfirmed);
        assert!(h.session.debounce_armed().await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smoothing_absorbs_single_fade() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();

        emit_all(&h.radio, &[-60, -60, -60, -60, -95]).await;
        // mean is -67: inside the hysteresis band, no transition
        assert_eq!(h.session.state().unwrap(), AppState::Present);
        assert!(!h.session.debounce_armed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_advertisements_are_ignored() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        let mut detections = h.scanner.subscribe_detections();
        h.scanner.start().await.unwrap();

        assert!(h.radio.emit(advertisement("CC:DD", "Headphones", -40)).await);
        emit_all(&h.radio, &[-50]).await;

        assert_eq!(detections.recv().await.unwrap().device_id, "AA:BB");
        assert!(detections.try_recv().is_err());
        assert_eq!(h.session.state().unwrap(), AppState::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_downgrades_after_silence() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();
        emit_all(&h.radio, &[-50]).await;

        tokio::time::sleep(Duration::from_secs(175)).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
        assert_eq!(h.sink.count(AttendanceKind::Exit), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_leaves_inside_area_alone() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        let mut changes = h.session.subscribe();
        h.scanner.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_skipped_while_backgrounded_on_suppressing_platform() {
        let h = harness(AppState::InsideArea, PlatformProfile::ios(), true);
        h.scanner.start().await.unwrap();
        emit_all(&h.radio, &[-50]).await;

        h.foreground.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);

        // Back in the foreground the silence window starts over
        h.foreground.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);

        tokio::time::sleep(Duration::from_secs(100)).await;
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_runs_while_backgrounded_elsewhere() {
        let h = harness(AppState::InsideArea, PlatformProfile::android(), false);
        h.scanner.start().await.unwrap();
        emit_all(&h.radio, &[-50]).await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        settle().await;
        assert_eq!(h.session.state().unwrap(), AppState::InsideArea);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_rolls_back() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.radio.fail_start.store(true, Ordering::SeqCst);

        let err = h.scanner.start().await.unwrap_err();
        assert!(matches!(err, ScanError::Platform(PlatformError::ScanStart(_))));
        assert!(!h.scanner.is_active());

        h.radio.fail_start.store(false, Ordering::SeqCst);
        h.scanner.start().await.unwrap();
        assert!(h.scanner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_never_ready() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.radio.not_ready.store(true, Ordering::SeqCst);

        let err = h.scanner.start().await.unwrap_err();
        assert!(matches!(err, ScanError::NotReady(_)));
        assert!(!h.scanner.is_active());
        assert_eq!(h.radio.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.scanner.stop();
        assert_eq!(h.radio.stops.load(Ordering::SeqCst), 0);

        h.scanner.start().await.unwrap();
        h.scanner.start().await.unwrap();
        assert_eq!(h.radio.starts.load(Ordering::SeqCst), 1);

        h.scanner.stop();
        h.scanner.stop();
        assert!(!h.scanner.is_active());
        assert_eq!(h.radio.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_ended_by_radio_releases_scanner() {
        let h = harness(AppState::InsideArea, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();
        emit_all(&h.radio, &[-80]).await;

        h.radio.end_scan();
        settle().await;
        assert!(!h.scanner.is_active());
        assert_eq!(h.radio.stops.load(Ordering::SeqCst), 1);
        assert!(h.scanner.radio_lease().try_lock_owned().is_ok());

        h.scanner.start().await.unwrap();
        assert!(h.scanner.is_active());
        assert_eq!(h.radio.starts.load(Ordering::SeqCst), 2);
        emit_all(&h.radio, &[-55]).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_processed_after_stop() {
        let h = harness(AppState::Present, PlatformProfile::generic(), true);
        h.scanner.start().await.unwrap();
        h.scanner.stop();

        assert!(!h.radio.emit(advertisement("AA:BB", "Office-Beacon-1", -90)).await);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.session.state().unwrap(), AppState::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_filter_requested_only_when_supported() {
        let beacon = BeaconConfig {
            service_uuids: vec!["0000feaa-0000-1000-8000-00805f9b34fb".to_string()],
            name_prefixes: Vec::new(),
            ..BeaconConfig::default()
        };

        let h = harness_with(AppState::InsideArea, PlatformProfile::android(), false, beacon.clone());
        h.scanner.start().await.unwrap();
        let request = h.radio.last_request.lock().unwrap().clone().unwrap();
        assert!(request.service_uuids.is_none());

        let h = harness_with(AppState::InsideArea, PlatformProfile::android(), true, beacon.clone());
        h.scanner.start().await.unwrap();
        let request = h.radio.last_request.lock().unwrap().clone().unwrap();
        assert!(request.service_uuids.is_some());

        let h = harness_with(AppState::InsideArea, PlatformProfile::ios(), false, beacon);
        h.scanner.start().await.unwrap();
        let request = h.radio.last_request.lock().unwrap().clone().unwrap();
        assert!(request.service_uuids.is_some());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let (session, _store, _sink) = session_in(AppState::Outside);
        let beacon = BeaconConfig {
            enter_threshold: -80,
            exit_threshold: -70,
            ..BeaconConfig::default()
        };
        let result = ContinuousScanner::new(
            session,
            Arc::new(FakeRadio::default()),
            Arc::new(FakeForeground(AtomicBool::new(true))),
            PlatformProfile::generic(),
            ScannerConfig::default(),
            &beacon,
        );
        assert!(matches!(result, Err(ScanError::InvalidThresholds { .. })));
    }
}
