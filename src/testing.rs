//! Test doubles for the platform seams and the attendance sink

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::attendance::{AttendanceError, AttendanceEvent, AttendanceKind, AttendanceSink};
use crate::models::{Advertisement, AppState};
use crate::persistence::{PresenceStore, SqlitePresenceStore};
use crate::platform::{
    BackgroundFetchStatus, BackgroundGrant, BackgroundScheduler, CapabilityProvider,
    ForegroundStatus, InvocationId, LocationFix, LocationProvider, PlatformError, RadioScanner,
    ScanRequest, TaskResult,
};
use crate::presence::PresenceSession;

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<AttendanceEvent>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn count(&self, kind: AttendanceKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[async_trait]
impl AttendanceSink for RecordingSink {
    async fn report(&self, event: &AttendanceEvent) -> Result<(), AttendanceError> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            Err(AttendanceError::Status(503))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FakeRadio {
    sender: Mutex<Option<mpsc::Sender<Advertisement>>>,
    pub preload: Mutex<Vec<Advertisement>>,
    pub fail_start: AtomicBool,
    pub not_ready: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub last_request: Mutex<Option<ScanRequest>>,
}

impl FakeRadio {
    pub async fn emit(&self, adv: Advertisement) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(adv).await.is_ok(),
            None => false,
        }
    }

    /// The radio ends the running scan by itself
    pub fn end_scan(&self) {
        self.sender.lock().unwrap().take();
    }
}

#[async_trait]
impl RadioScanner for FakeRadio {
    async fn wait_ready(&self) -> Result<(), PlatformError> {
        if self.not_ready.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        request: ScanRequest,
    ) -> Result<mpsc::Receiver<Advertisement>, PlatformError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PlatformError::ScanStart("radio busy".to_string()));
        }
        *self.last_request.lock().unwrap() = Some(request);
        let (tx, rx) = mpsc::channel(64);
        for adv in self.preload.lock().unwrap().drain(..) {
            let _ = tx.try_send(adv);
        }
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn stop_scan(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}

pub struct FakeScheduler {
    pub running: AtomicBool,
    pub configured: Mutex<Option<Duration>>,
    pub starts: AtomicUsize,
    pub finished: Mutex<Vec<(InvocationId, TaskResult)>>,
    pub status: Mutex<BackgroundFetchStatus>,
}

impl Default for FakeScheduler {
    fn default() -> Self {
        FakeScheduler {
            running: AtomicBool::new(false),
            configured: Mutex::new(None),
            starts: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
            status: Mutex::new(BackgroundFetchStatus::Available),
        }
    }
}

#[async_trait]
impl BackgroundScheduler for FakeScheduler {
    async fn configure(&self, interval: Duration) -> Result<(), PlatformError> {
        *self.configured.lock().unwrap() = Some(interval);
        Ok(())
    }

    async fn start(&self) -> Result<(), PlatformError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn finish(&self, invocation: InvocationId, result: TaskResult) {
        self.finished.lock().unwrap().push((invocation, result));
    }

    async fn status(&self) -> BackgroundFetchStatus {
        *self.status.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakeGrant {
    pub held: AtomicBool,
    pub acquisitions: AtomicUsize,
}

#[async_trait]
impl BackgroundGrant for FakeGrant {
    async fn acquire(&self) -> Result<(), PlatformError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

pub struct FakeCapabilities {
    pub notifications: AtomicBool,
    pub battery: AtomicBool,
    pub grant_on_request: AtomicBool,
    pub requests: AtomicUsize,
}

impl FakeCapabilities {
    pub fn granted() -> Self {
        FakeCapabilities {
            notifications: AtomicBool::new(true),
            battery: AtomicBool::new(true),
            grant_on_request: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn denied() -> Self {
        FakeCapabilities {
            notifications: AtomicBool::new(false),
            battery: AtomicBool::new(false),
            grant_on_request: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CapabilityProvider for FakeCapabilities {
    async fn notifications_granted(&self) -> bool {
        self.notifications.load(Ordering::SeqCst)
    }

    async fn request_notifications(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let granted = self.grant_on_request.load(Ordering::SeqCst);
        self.notifications.store(granted, Ordering::SeqCst);
        granted
    }

    async fn battery_optimization_exempt(&self) -> bool {
        self.battery.load(Ordering::SeqCst)
    }

    async fn request_battery_exemption(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let granted = self.grant_on_request.load(Ordering::SeqCst);
        self.battery.store(granted, Ordering::SeqCst);
        granted
    }
}

#[derive(Default)]
pub struct FakeLocation {
    pub fix: Mutex<Option<LocationFix>>,
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn current_fix(&self) -> Result<Option<LocationFix>, PlatformError> {
        Ok(*self.fix.lock().unwrap())
    }
}

pub struct FakeForeground(pub AtomicBool);

impl ForegroundStatus for FakeForeground {
    fn is_foreground(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn advertisement(device_id: &str, name: &str, rssi: i16) -> Advertisement {
    Advertisement {
        device_id: device_id.to_string(),
        name: Some(name.to_string()),
        rssi,
        service_uuids: Vec::new(),
    }
}

/// A session over a fresh in-memory store, starting in `state`
pub fn session_in(
    state: AppState,
) -> (Arc<PresenceSession>, Arc<SqlitePresenceStore>, Arc<RecordingSink>) {
    let store = Arc::new(SqlitePresenceStore::in_memory().unwrap());
    store.set_app_state(state).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let session = PresenceSession::open(store.clone(), sink.clone()).unwrap();
    (session, store, sink)
}

/// Let spawned tasks run; time only advances when everything is idle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn now_minus(secs: i64) -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(secs)
}
