//! The presence session: single owner of state transitions
//!
//! Every producer (geofence callbacks, the scan pump, the debounce timer,
//! the watchdog, periodic wake-ups) goes through this type. Transitions
//! are computed and their bookkeeping written under one async mutex; the
//! resulting attendance POSTs run after the lock is released so a slow
//! network never holds up the next trigger.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::hysteresis::{classify, SignalVerdict, Thresholds};
use super::PresenceError;
use crate::attendance::{AttendanceEvent, AttendanceSink};
use crate::models::{AppState, Detection, DeviceRef, PresenceRecord, StateChange, TransitionCause};
use crate::persistence::{keys, PresenceStore};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Result of a state-changing call
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AppState,
    pub to: AppState,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
    /// An exit attendance report was posted as part of this transition
    pub exit_reported: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    fn unchanged(state: AppState, cause: TransitionCause, at: DateTime<Utc>) -> Self {
        Transition {
            from: state,
            to: state,
            cause,
            at,
            exit_reported: false,
        }
    }
}

enum Effect {
    /// Carries the session epoch the claim was made in
    ReportEnter(DeviceRef, u64),
    ReportExit(Option<DeviceRef>),
}

struct Applied {
    transition: Transition,
    effects: Vec<Effect>,
}

struct DebounceTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionInner {
    /// Only ever set while the state is `Unconfirmed`
    debounce: Option<DebounceTimer>,
    next_timer_id: u64,
    /// Bumped every time a session ends
    epoch: u64,
    /// Epoch of the enter report currently being posted
    enter_in_flight: Option<u64>,
    inside_area_in_flight: bool,
}

impl SessionInner {
    fn cancel_debounce(&mut self) -> bool {
        match self.debounce.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Owned presence session shared by all collaborators
pub struct PresenceSession {
    store: Arc<dyn PresenceStore>,
    sink: Arc<dyn AttendanceSink>,
    inner: Mutex<SessionInner>,
    changes: broadcast::Sender<StateChange>,
}

impl PresenceSession {
    /// Construct a session over the persisted store
    ///
    /// Nothing is cached: the store is read on every call, so a session
    /// opened in a headless wake-up sees what the main process wrote.
    pub fn open(
        store: Arc<dyn PresenceStore>,
        sink: Arc<dyn AttendanceSink>,
    ) -> Result<Arc<Self>, PresenceError> {
        let state = store.app_state()?;
        log::info!("Presence session opened in state {}", state);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Arc::new(PresenceSession {
            store,
            sink,
            inner: Mutex::new(SessionInner::default()),
            changes,
        }))
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    pub fn state(&self) -> Result<AppState, PresenceError> {
        Ok(self.store.app_state()?)
    }

    pub fn record(&self) -> Result<PresenceRecord, PresenceError> {
        Ok(self.store.record()?)
    }

    /// Receive every committed transition
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub async fn debounce_armed(&self) -> bool {
        self.inner.lock().await.debounce.is_some()
    }

    pub async fn cancel_debounce(&self) {
        if self.inner.lock().await.cancel_debounce() {
            log::debug!("Debounce timer cancelled");
        }
    }

    /// Unconditional setter
    pub async fn transition(
        self: &Arc<Self>,
        to: AppState,
        cause: TransitionCause,
    ) -> Result<Transition, PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            let from = self.store.app_state()?;
            self.apply(&mut inner, from, to, cause, Utc::now(), None)?
        };
        Ok(self.finish(applied).await)
    }

    /// Transition only when the current state is one of `allowed`
    pub async fn transition_from(
        self: &Arc<Self>,
        allowed: &[AppState],
        to: AppState,
        cause: TransitionCause,
    ) -> Result<Option<Transition>, PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            let from = self.store.app_state()?;
            if !allowed.contains(&from) {
                return Ok(None);
            }
            self.apply(&mut inner, from, to, cause, Utc::now(), None)?
        };
        Ok(Some(self.finish(applied).await))
    }

    /// `Outside -> InsideArea`; a redelivered enter never downgrades
    pub async fn enter_area(
        self: &Arc<Self>,
        cause: TransitionCause,
    ) -> Result<Option<Transition>, PresenceError> {
        self.transition_from(&[AppState::Outside], AppState::InsideArea, cause)
            .await
    }

    /// Force `Present`/`Unconfirmed` back to `InsideArea`
    pub async fn force_downgrade(
        self: &Arc<Self>,
        cause: TransitionCause,
    ) -> Result<Option<Transition>, PresenceError> {
        self.transition_from(
            &[AppState::Present, AppState::Unconfirmed],
            AppState::InsideArea,
            cause,
        )
        .await
    }

    /// End the session: clear bookkeeping, cancel the debounce, go `Outside`
    pub async fn end_session(
        self: &Arc<Self>,
        cause: TransitionCause,
    ) -> Result<Transition, PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            inner.cancel_debounce();
            let from = self.store.app_state()?;
            let applied = self.apply(&mut inner, from, AppState::Outside, cause, Utc::now(), None)?;
            self.store.clear_session_record()?;
            applied
        };
        Ok(self.finish(applied).await)
    }

    /// Geofence exit: end the session with exactly one exit report
    ///
    /// Leaving the present family already reports; leaving `InsideArea`
    /// reports here. A redelivered exit while `Outside` reports nothing.
    pub async fn exit_area(
        self: &Arc<Self>,
        cause: TransitionCause,
    ) -> Result<Transition, PresenceError> {
        let device = self.store.last_device()?;
        let mut transition = self.end_session(cause).await?;
        if transition.changed() && !transition.exit_reported {
            transition.exit_reported = true;
            if let Err(e) = self.sink.report(&AttendanceEvent::exit(device, Utc::now())).await {
                log::debug!("Exit report not delivered: {}", e);
            }
        }
        Ok(transition)
    }

    /// Feed one smoothed reading from the continuous scanner
    ///
    /// `live` is the scanner's liveness flag; it is checked under the
    /// session lock so nothing is processed once the scanner was stopped.
    pub async fn on_detection(
        self: &Arc<Self>,
        detection: &Detection,
        smoothed: f64,
        thresholds: &Thresholds,
        debounce: Duration,
        live: &AtomicBool,
    ) -> Result<Option<Transition>, PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            if !live.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let from = self.store.app_state()?;
            if from == AppState::Outside {
                return Ok(None);
            }
            self.record_seen(detection)?;

            let (to, cause) = match classify(from, smoothed, thresholds) {
                SignalVerdict::Confirm | SignalVerdict::Requalify => {
                    (AppState::Present, TransitionCause::BeaconDetected)
                }
                SignalVerdict::Lose => (AppState::Unconfirmed, TransitionCause::SignalLost),
                SignalVerdict::Hold => return Ok(None),
            };

            let applied =
                self.apply(&mut inner, from, to, cause, detection.timestamp, Some(detection))?;
            if to == AppState::Unconfirmed {
                self.arm_debounce(&mut inner, debounce);
            }
            applied
        };
        Ok(Some(self.finish(applied).await))
    }

    /// A periodic scan found the beacon
    pub async fn mark_present(
        self: &Arc<Self>,
        detection: &Detection,
        cause: TransitionCause,
    ) -> Result<Option<Transition>, PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            let from = self.store.app_state()?;
            if from == AppState::Outside {
                return Ok(None);
            }
            self.record_seen(detection)?;
            if from == AppState::Present {
                return Ok(None);
            }
            self.apply(
                &mut inner,
                from,
                AppState::Present,
                cause,
                detection.timestamp,
                Some(detection),
            )?
        };
        Ok(Some(self.finish(applied).await))
    }

    /// Post the inside-area status unless already reported this session
    ///
    /// Returns whether a report was delivered by this call.
    pub async fn report_inside_area(&self) -> Result<bool, PresenceError> {
        {
            let mut inner = self.inner.lock().await;
            if self.store.app_state()? != AppState::InsideArea
                || self.store.flag(keys::INSIDE_AREA_REPORTED)?
                || inner.inside_area_in_flight
            {
                return Ok(false);
            }
            inner.inside_area_in_flight = true;
        }

        let result = self.sink.report(&AttendanceEvent::inside_area(Utc::now())).await;

        let mut inner = self.inner.lock().await;
        inner.inside_area_in_flight = false;
        if result.is_ok() && self.store.app_state()? == AppState::InsideArea {
            self.store.set_flag(keys::INSIDE_AREA_REPORTED, true)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn record_seen(&self, detection: &Detection) -> Result<(), PresenceError> {
        self.store
            .set_timestamp(keys::LAST_SEEN_AT, Some(detection.timestamp))?;
        self.store.set_last_device(Some(&detection.device()))?;
        Ok(())
    }

    /// Write one transition and collect its side effects; caller holds the lock
    fn apply(
        &self,
        inner: &mut SessionInner,
        from: AppState,
        to: AppState,
        cause: TransitionCause,
        at: DateTime<Utc>,
        detection: Option<&Detection>,
    ) -> Result<Applied, PresenceError> {
        let mut effects = Vec::new();
        if from == to {
            return Ok(Applied {
                transition: Transition::unchanged(from, cause, at),
                effects,
            });
        }

        self.store.set_app_state(to)?;

        if to != AppState::Unconfirmed {
            inner.cancel_debounce();
        }

        if from == AppState::InsideArea {
            self.store.set_flag(keys::INSIDE_AREA_REPORTED, false)?;
        }

        if from.is_present_family() && !to.is_present_family() {
            effects.push(Effect::ReportExit(self.store.last_device()?));
        }

        if to == AppState::Outside {
            self.store.clear_session_record()?;
            inner.epoch += 1;
            inner.enter_in_flight = None;
        }

        if to == AppState::Present
            && from != AppState::Present
            && self.store.timestamp(keys::ENTER_SENT_AT)?.is_none()
            && inner.enter_in_flight.is_none()
        {
            let device = match detection {
                Some(d) => Some(d.device()),
                None => self.store.last_device()?,
            };
            match device {
                Some(device) => {
                    inner.enter_in_flight = Some(inner.epoch);
                    effects.push(Effect::ReportEnter(device, inner.epoch));
                }
                None => log::warn!("Entered PRESENT without a known beacon, enter report skipped"),
            }
        }

        let change = StateChange { from, to, cause, at };
        if let Err(e) = self.store.append_transition(&change) {
            log::warn!("Failed to journal transition: {}", e);
        }
        log::info!("Presence {} -> {} ({})", from, to, cause);
        // No subscribers is fine
        let _ = self.changes.send(change);

        Ok(Applied {
            transition: Transition {
                from,
                to,
                cause,
                at,
                exit_reported: false,
            },
            effects,
        })
    }

    /// Run the side effects of an applied transition outside the lock
    async fn finish(&self, applied: Applied) -> Transition {
        let Applied {
            mut transition,
            effects,
        } = applied;

        for effect in effects {
            match effect {
                Effect::ReportExit(device) => {
                    transition.exit_reported = true;
                    if let Err(e) = self.sink.report(&AttendanceEvent::exit(device, Utc::now())).await {
                        log::debug!("Exit report not delivered: {}", e);
                    }
                }
                Effect::ReportEnter(device, epoch) => {
                    let sent_at = Utc::now();
                    let result = self.sink.report(&AttendanceEvent::enter(device, sent_at)).await;
                    if let Err(e) = self.commit_enter(epoch, result.is_ok(), sent_at).await {
                        log::warn!("Failed to record enter report: {}", e);
                    }
                }
            }
        }
        transition
    }

    async fn commit_enter(
        &self,
        epoch: u64,
        delivered: bool,
        sent_at: DateTime<Utc>,
    ) -> Result<(), PresenceError> {
        let mut inner = self.inner.lock().await;
        // A session that ended while the POST was in flight must not inherit the flag
        if inner.enter_in_flight != Some(epoch) {
            return Ok(());
        }
        inner.enter_in_flight = None;
        if delivered {
            self.store.set_timestamp(keys::ENTER_SENT_AT, Some(sent_at))?;
        }
        Ok(())
    }

    fn arm_debounce(self: &Arc<Self>, inner: &mut SessionInner, duration: Duration) {
        inner.cancel_debounce();
        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        let session: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(session) = session.upgrade() {
                if let Err(e) = session.fire_debounce(id).await {
                    log::error!("Debounce expiry failed: {}", e);
                }
            }
        });
        inner.debounce = Some(DebounceTimer { id, handle });
        log::debug!("Debounce armed for {:?}", duration);
    }

    /// First to execute wins: a re-detection that already took the slot makes this a no-op
    async fn fire_debounce(self: &Arc<Self>, id: u64) -> Result<(), PresenceError> {
        let applied = {
            let mut inner = self.inner.lock().await;
            match inner.debounce.as_ref() {
                Some(timer) if timer.id == id => {
                    inner.debounce = None;
                }
                _ => return Ok(()),
            }
            if self.store.app_state()? != AppState::Unconfirmed {
                return Ok(());
            }
            self.apply(
                &mut inner,
                AppState::Unconfirmed,
                AppState::InsideArea,
                TransitionCause::DebounceExpired,
                Utc::now(),
                None,
            )?
        };
        self.finish(applied).await;
        Ok(())
    }
}
