//! Platform adapters for running as a daemon
//!
//! Each adapter implements one platform trait on top of state pushed in by
//! the input module, so the same presence core runs on a desktop host.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::models::Advertisement;
use crate::platform::{
    BackgroundFetchStatus, BackgroundGrant, BackgroundScheduler, CapabilityProvider,
    ForegroundStatus, InvocationId, LocationFix, LocationProvider, PlatformError, RadioScanner,
    ScanRequest, TaskResult,
};

const SCAN_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Radio fed with advertisements from the input stream
pub struct ChannelRadio {
    powered: watch::Sender<bool>,
    scan: Mutex<Option<(mpsc::Sender<Advertisement>, ScanRequest)>>,
}

impl ChannelRadio {
    pub fn new(powered: bool) -> Self {
        let (powered, _) = watch::channel(powered);
        ChannelRadio {
            powered,
            scan: Mutex::new(None),
        }
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.send_replace(powered);
        if !powered {
            // A powered-off radio ends the running scan
            lock(&self.scan).take();
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).is_some()
    }

    /// Hand an advertisement to the running scan; returns whether it was delivered
    pub fn deliver(&self, adv: Advertisement) -> bool {
        let guard = lock(&self.scan);
        let (sender, request) = match guard.as_ref() {
            Some(scan) => scan,
            None => return false,
        };

        if let Some(ref wanted) = request.service_uuids {
            let matches = adv
                .service_uuids
                .iter()
                .any(|uuid| wanted.iter().any(|w| w.eq_ignore_ascii_case(uuid)));
            if !matches {
                return false;
            }
        }

        match sender.try_send(adv) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping advertisement: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl RadioScanner for ChannelRadio {
    async fn wait_ready(&self) -> Result<(), PlatformError> {
        let mut powered = self.powered.subscribe();
        let ready = powered.wait_for(|on| *on).await.map(|_| ());
        ready.map_err(|_| PlatformError::RadioUnavailable("radio state closed".to_string()))
    }

    async fn start_scan(
        &self,
        request: ScanRequest,
    ) -> Result<mpsc::Receiver<Advertisement>, PlatformError> {
        if !*self.powered.borrow() {
            return Err(PlatformError::RadioUnavailable("radio is powered off".to_string()));
        }
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        *lock(&self.scan) = Some((tx, request));
        Ok(rx)
    }

    fn stop_scan(&self) {
        lock(&self.scan).take();
    }
}

/// Radio that plays back recorded advertisements to every scan
///
/// Used for one-shot headless runs where no live event stream exists.
pub struct ReplayRadio {
    recorded: Vec<Advertisement>,
    scan: Mutex<Option<mpsc::Sender<Advertisement>>>,
}

impl ReplayRadio {
    pub fn new(recorded: Vec<Advertisement>) -> Self {
        ReplayRadio {
            recorded,
            scan: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RadioScanner for ReplayRadio {
    async fn wait_ready(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn start_scan(
        &self,
        request: ScanRequest,
    ) -> Result<mpsc::Receiver<Advertisement>, PlatformError> {
        let (tx, rx) = mpsc::channel(self.recorded.len().max(1));
        for adv in &self.recorded {
            let wanted = match request.service_uuids {
                Some(ref uuids) => adv
                    .service_uuids
                    .iter()
                    .any(|u| uuids.iter().any(|w| w.eq_ignore_ascii_case(u))),
                None => true,
            };
            if wanted {
                let _ = tx.try_send(adv.clone());
            }
        }
        // Keep the scan open until stopped, like a real radio
        *lock(&self.scan) = Some(tx);
        Ok(rx)
    }

    fn stop_scan(&self) {
        lock(&self.scan).take();
    }
}

/// Periodic wake-ups from a tokio interval
///
/// Invocations are delivered on the receiver returned by `new`; the daemon
/// runs the periodic task for each one and the task calls `finish`.
pub struct IntervalScheduler {
    interval: Mutex<Duration>,
    status: BackgroundFetchStatus,
    wakeups: mpsc::Sender<InvocationId>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    next_invocation: Arc<AtomicU64>,
}

impl IntervalScheduler {
    pub fn new(
        interval: Duration,
        status: BackgroundFetchStatus,
    ) -> (Self, mpsc::Receiver<InvocationId>) {
        let (wakeups, rx) = mpsc::channel(4);
        let scheduler = IntervalScheduler {
            interval: Mutex::new(interval),
            status,
            wakeups,
            ticker: Mutex::new(None),
            next_invocation: Arc::new(AtomicU64::new(1)),
        };
        (scheduler, rx)
    }
}

#[async_trait]
impl BackgroundScheduler for IntervalScheduler {
    async fn configure(&self, interval: Duration) -> Result<(), PlatformError> {
        if interval.is_zero() {
            return Err(PlatformError::Scheduler("interval must be non-zero".to_string()));
        }
        *lock(&self.interval) = interval;
        Ok(())
    }

    async fn start(&self) -> Result<(), PlatformError> {
        if self.status != BackgroundFetchStatus::Available {
            return Err(PlatformError::Scheduler(format!(
                "background fetch is {:?}",
                self.status
            )));
        }

        let mut ticker = lock(&self.ticker);
        if ticker.is_some() {
            return Ok(());
        }

        let period = *lock(&self.interval);
        let wakeups = self.wakeups.clone();
        let counter = self.next_invocation.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let invocation = InvocationId(counter.fetch_add(1, Ordering::SeqCst));
                // A full queue means the previous wake-up is still running
                if let Err(mpsc::error::TrySendError::Closed(_)) = wakeups.try_send(invocation) {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
            log::debug!("Periodic wake-ups stopped");
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.ticker).is_some()
    }

    fn finish(&self, invocation: InvocationId, result: TaskResult) {
        log::debug!("Invocation {:?} finished with {:?}", invocation, result);
    }

    async fn status(&self) -> BackgroundFetchStatus {
        self.status
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A daemon needs no OS grant to keep running; the grant is only tracked
#[derive(Default)]
pub struct LoggingGrant {
    held: AtomicBool,
}

impl LoggingGrant {
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundGrant for LoggingGrant {
    async fn acquire(&self) -> Result<(), PlatformError> {
        if !self.held.swap(true, Ordering::SeqCst) {
            log::info!("Background execution grant acquired");
        }
        Ok(())
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            log::info!("Background execution grant released");
        }
    }
}

/// Capabilities fixed by configuration; prompts cannot change them
pub struct StaticCapabilities {
    notifications: bool,
    battery_exempt: bool,
}

impl StaticCapabilities {
    pub fn from_config(config: &HostConfig) -> Self {
        StaticCapabilities {
            notifications: config.notifications_granted,
            battery_exempt: config.battery_optimization_exempt,
        }
    }
}

#[async_trait]
impl CapabilityProvider for StaticCapabilities {
    async fn notifications_granted(&self) -> bool {
        self.notifications
    }

    async fn request_notifications(&self) -> bool {
        log::info!("Notification permission is fixed by configuration");
        self.notifications
    }

    async fn battery_optimization_exempt(&self) -> bool {
        self.battery_exempt
    }

    async fn request_battery_exemption(&self) -> bool {
        log::info!("Battery exemption is fixed by configuration");
        self.battery_exempt
    }
}

/// Remembers the most recent location fix from the input stream
#[derive(Default)]
pub struct LatestFixLocation {
    fix: Mutex<Option<LocationFix>>,
}

impl LatestFixLocation {
    pub fn update(&self, fix: LocationFix) {
        *lock(&self.fix) = Some(fix);
    }
}

#[async_trait]
impl LocationProvider for LatestFixLocation {
    async fn current_fix(&self) -> Result<Option<LocationFix>, PlatformError> {
        Ok(*lock(&self.fix))
    }
}

pub struct ForegroundFlag(AtomicBool);

impl ForegroundFlag {
    pub fn new(foreground: bool) -> Self {
        ForegroundFlag(AtomicBool::new(foreground))
    }

    pub fn set(&self, foreground: bool) {
        self.0.store(foreground, Ordering::SeqCst);
    }
}

impl ForegroundStatus for ForegroundFlag {
    fn is_foreground(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
