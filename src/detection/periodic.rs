//! Periodic fallback task
//!
//! Runs on coarse OS wake-ups, possibly in a fresh process with nothing in
//! memory. Every invocation reloads state from the store, expires stale
//! presence, and decides whether a short bounded scan is worth the battery.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp;
use std::sync::Arc;

use super::continuous::{ContinuousScanner, RadioLease};
use super::filter::ScanFilter;
use super::{PeriodicError, ScanError};
use crate::attendance::AttendanceReporter;
use crate::config::{Config, PeriodicConfig};
use crate::models::{AppState, Detection, TransitionCause};
use crate::persistence::{keys, PresenceStore};
use crate::platform::{
    BackgroundScheduler, InvocationId, PlatformError, PlatformProfile, RadioScanner, TaskResult,
};
use crate::presence::{PresenceSession, Thresholds, Transition};

/// Why an invocation did not scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ScannerActive,
    Outside,
    /// The beacon was seen recently enough
    FreshDetection,
    /// Still inside the backoff window after failed scans
    RapidRetry,
    /// The previous scan attempt was too recent
    MinRetryInterval,
    /// Another invocation is still running
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeriodicOutcome {
    Skipped(SkipReason),
    Found(Detection),
    /// The scan ran to its timeout without a qualifying beacon
    NotFound,
    /// The radio could not be used
    RadioFailed(PlatformError),
}

/// What one invocation did
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicRun {
    /// Downgrade applied because presence went stale
    pub expired: Option<Transition>,
    pub inside_area_reported: bool,
    pub outcome: PeriodicOutcome,
}

impl PeriodicRun {
    fn skipped(reason: SkipReason) -> Self {
        PeriodicRun {
            expired: None,
            inside_area_reported: false,
            outcome: PeriodicOutcome::Skipped(reason),
        }
    }

    /// Result handed back to the OS scheduler
    pub fn task_result(&self) -> TaskResult {
        match self.outcome {
            PeriodicOutcome::Found(_) => TaskResult::NewData,
            PeriodicOutcome::RadioFailed(_) => TaskResult::Failed,
            _ if self.expired.is_some() || self.inside_area_reported => TaskResult::NewData,
            _ => TaskResult::NoData,
        }
    }
}

/// Delay before the next scan after `streak` consecutive failures
pub fn backoff_delay(streak: u32, base_secs: i64, max_secs: i64) -> ChronoDuration {
    if streak == 0 {
        return ChronoDuration::zero();
    }
    let exponent = cmp::min(streak - 1, 30);
    let delay = base_secs.saturating_mul(1i64 << exponent);
    ChronoDuration::seconds(cmp::min(delay, max_secs))
}

pub struct PeriodicTask {
    session: Arc<PresenceSession>,
    radio: Arc<dyn RadioScanner>,
    scanner: Option<Arc<ContinuousScanner>>,
    profile: PlatformProfile,
    filter: ScanFilter,
    thresholds: Thresholds,
    config: PeriodicConfig,
    busy: tokio::sync::Mutex<()>,
    radio_lease: RadioLease,
}

enum ScanAttempt {
    /// The continuous scanner took the radio first
    Yielded,
    Found(Detection),
    Ended,
}

/// Stops the scan it started once dropped, timeout included
struct OwnedScan<'a> {
    radio: &'a dyn RadioScanner,
    _lease: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for OwnedScan<'_> {
    fn drop(&mut self) {
        self.radio.stop_scan();
    }
}

impl PeriodicTask {
    pub fn new(
        session: Arc<PresenceSession>,
        radio: Arc<dyn RadioScanner>,
        profile: PlatformProfile,
        filter: ScanFilter,
        thresholds: Thresholds,
        config: PeriodicConfig,
    ) -> Self {
        PeriodicTask {
            session,
            radio,
            scanner: None,
            profile,
            filter,
            thresholds,
            config,
            busy: tokio::sync::Mutex::new(()),
            radio_lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Skip invocations while this scanner is running and share its radio
    pub fn with_scanner(mut self, scanner: Arc<ContinuousScanner>) -> Self {
        self.radio_lease = scanner.radio_lease();
        self.scanner = Some(scanner);
        self
    }

    /// Build a task for a headless wake-up, trusting only the persisted store
    pub fn headless(
        config: &Config,
        store: Arc<dyn PresenceStore>,
        radio: Arc<dyn RadioScanner>,
    ) -> Result<Self, PeriodicError> {
        let profile = config.platform.resolve()?;
        let filter = ScanFilter::from_config(&config.beacon).map_err(ScanError::from)?;
        let thresholds = Thresholds::new(config.beacon.enter_threshold, config.beacon.exit_threshold)
            .ok_or(ScanError::InvalidThresholds {
                enter: config.beacon.enter_threshold,
                exit: config.beacon.exit_threshold,
            })?;
        let reporter = Arc::new(AttendanceReporter::new(
            config.attendance.clone(),
            store.clone(),
        ));
        let session = PresenceSession::open(store, reporter)?;

        Ok(Self::new(
            session,
            radio,
            profile,
            filter,
            thresholds,
            config.periodic.clone(),
        ))
    }

    pub fn session(&self) -> &Arc<PresenceSession> {
        &self.session
    }

    /// Handle one scheduler wake-up; always signals completion
    pub async fn on_wake(&self, scheduler: &dyn BackgroundScheduler, invocation: InvocationId) -> TaskResult {
        let result = match self.run_at(Utc::now()).await {
            Ok(run) => {
                log::debug!("Periodic invocation {:?}: {:?}", invocation, run.outcome);
                run.task_result()
            }
            Err(e) => {
                log::error!("Periodic invocation {:?} failed: {}", invocation, e);
                TaskResult::Failed
            }
        };
        scheduler.finish(invocation, result);
        result
    }

    /// One invocation evaluated against `now`
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<PeriodicRun, PeriodicError> {
        let _busy = match self.busy.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(PeriodicRun::skipped(SkipReason::Busy)),
        };

        if self.scanner.as_ref().map(|s| s.is_active()).unwrap_or(false) {
            return Ok(PeriodicRun::skipped(SkipReason::ScannerActive));
        }

        let state = self.session.state()?;
        if state == AppState::Outside {
            return Ok(PeriodicRun::skipped(SkipReason::Outside));
        }

        let record = self.session.record()?;
        let ttl = ChronoDuration::seconds(self.config.presence_ttl_secs);
        let stale = record
            .last_seen_at
            .map(|seen| now.signed_duration_since(seen) > ttl)
            .unwrap_or(true);

        let expired = match state {
            AppState::Present if stale => {
                self.session
                    .transition_from(&[AppState::Present], AppState::Unconfirmed, TransitionCause::PeriodicTtl)
                    .await?
            }
            AppState::Unconfirmed if stale => self.session.force_downgrade(TransitionCause::PeriodicTtl).await?,
            _ => None,
        };

        let inside_area_reported = self.session.report_inside_area().await?;

        if let Some(reason) = self.backoff_gate(now)? {
            log::debug!("Periodic scan skipped: {:?}", reason);
            return Ok(PeriodicRun {
                expired,
                inside_area_reported,
                outcome: PeriodicOutcome::Skipped(reason),
            });
        }

        let store = self.session.store();
        store.set_timestamp(keys::LAST_SCAN_ATTEMPT_AT, Some(now))?;
        let outcome = self.bounded_scan().await;

        if self.session.state()? == AppState::Outside {
            // The session ended while scanning, its bookkeeping is gone
            return Ok(PeriodicRun {
                expired,
                inside_area_reported,
                outcome,
            });
        }

        match outcome {
            PeriodicOutcome::Found(ref detection) => {
                store.set_scan_failure_streak(0)?;
                store.set_timestamp(keys::RAPID_RETRY_UNTIL, None)?;
                self.session
                    .mark_present(detection, TransitionCause::PeriodicScan)
                    .await?;
            }
            PeriodicOutcome::NotFound | PeriodicOutcome::RadioFailed(_) => {
                let streak = store.scan_failure_streak()?.saturating_add(1);
                let delay = backoff_delay(
                    streak,
                    self.config.backoff_base_secs,
                    self.config.backoff_max_secs,
                );
                store.set_scan_failure_streak(streak)?;
                store.set_timestamp(keys::RAPID_RETRY_UNTIL, Some(now + delay))?;
                log::info!(
                    "Periodic scan found no beacon ({} in a row), next attempt in {}s",
                    streak,
                    delay.num_seconds()
                );
            }
            PeriodicOutcome::Skipped(_) => {}
        }

        Ok(PeriodicRun {
            expired,
            inside_area_reported,
            outcome,
        })
    }

    fn backoff_gate(&self, now: DateTime<Utc>) -> Result<Option<SkipReason>, PeriodicError> {
        let record = self.session.record()?;

        if let Some(seen) = record.last_seen_at {
            if now.signed_duration_since(seen) < ChronoDuration::seconds(self.config.fresh_detection_secs) {
                return Ok(Some(SkipReason::FreshDetection));
            }
        }
        if let Some(until) = record.rapid_retry_until {
            if until > now {
                return Ok(Some(SkipReason::RapidRetry));
            }
        }
        if let Some(attempt) = record.last_scan_attempt_at {
            if now.signed_duration_since(attempt) < ChronoDuration::seconds(self.config.min_retry_secs) {
                return Ok(Some(SkipReason::MinRetryInterval));
            }
        }
        Ok(None)
    }

    /// Scan until the first qualifying beacon or the timeout
    async fn bounded_scan(&self) -> PeriodicOutcome {
        let request = self
            .filter
            .scan_request(self.profile.can_filter_by_service_while_backgrounded);

        let scan = async {
            self.radio.wait_ready().await?;
            // The radio may have come back for the continuous scanner meanwhile
            let lease = match self.radio_lease.clone().try_lock_owned() {
                Ok(lease) => lease,
                Err(_) => return Ok(ScanAttempt::Yielded),
            };
            let _owned = OwnedScan {
                radio: self.radio.as_ref(),
                _lease: lease,
            };
            let mut receiver = self.radio.start_scan(request).await?;
            while let Some(adv) = receiver.recv().await {
                if self.filter.matches(&adv) && self.thresholds.qualifies(f64::from(adv.rssi)) {
                    return Ok(ScanAttempt::Found(Detection::from_advertisement(&adv, Utc::now())));
                }
            }
            Ok::<ScanAttempt, PlatformError>(ScanAttempt::Ended)
        };

        match tokio::time::timeout(self.config.scan_timeout(), scan).await {
            Ok(Ok(ScanAttempt::Yielded)) => {
                log::debug!("Continuous scanner owns the radio, periodic scan yielded");
                PeriodicOutcome::Skipped(SkipReason::ScannerActive)
            }
            Ok(Ok(ScanAttempt::Found(detection))) => {
                log::info!("Periodic scan found beacon {}", detection.device_id);
                PeriodicOutcome::Found(detection)
            }
            Ok(Ok(ScanAttempt::Ended)) | Err(_) => PeriodicOutcome::NotFound,
            Ok(Err(e)) => {
                log::warn!("Periodic scan failed: {}", e);
                PeriodicOutcome::RadioFailed(e)
            }
        }
    }
}
