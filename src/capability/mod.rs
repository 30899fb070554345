//! Background capability checks
//!
//! Decides how much background work the platform will let us do. Missing
//! capabilities degrade the scan strategy; they are never errors.

use std::sync::Arc;

use crate::persistence::{PersistenceError, PresenceStore, PromptKind};
use crate::platform::{BackgroundFetchStatus, BackgroundScheduler, CapabilityProvider, PlatformProfile};

/// Point-in-time view of the capabilities that matter for scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub notifications_granted: bool,
    /// Exempt from battery optimization, or the platform does not need it
    pub battery_optimization_ok: bool,
    pub background_fetch_status: BackgroundFetchStatus,
}

impl CapabilitySnapshot {
    pub fn periodic_available(&self) -> bool {
        self.background_fetch_status == BackgroundFetchStatus::Available
    }
}

/// How beacons will be looked for while inside the geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Continuous,
    PeriodicOnly,
}

pub struct CapabilityManager {
    provider: Arc<dyn CapabilityProvider>,
    scheduler: Arc<dyn BackgroundScheduler>,
    store: Arc<dyn PresenceStore>,
    profile: PlatformProfile,
}

impl CapabilityManager {
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        scheduler: Arc<dyn BackgroundScheduler>,
        store: Arc<dyn PresenceStore>,
        profile: PlatformProfile,
    ) -> Self {
        CapabilityManager {
            provider,
            scheduler,
            store,
            profile,
        }
    }

    pub async fn snapshot(&self) -> CapabilitySnapshot {
        let notifications_granted = self.provider.notifications_granted().await;
        let battery_optimization_ok =
            !self.profile.needs_battery_exemption || self.provider.battery_optimization_exempt().await;
        CapabilitySnapshot {
            notifications_granted,
            battery_optimization_ok,
            background_fetch_status: self.scheduler.status().await,
        }
    }

    /// Ask for missing capabilities, at most once per prompt kind
    pub async fn ensure(&self) -> Result<CapabilitySnapshot, PersistenceError> {
        if self.profile.needs_notification_permission
            && !self.provider.notifications_granted().await
            && !self.store.prompt_shown(PromptKind::Notifications)?
        {
            let granted = self.provider.request_notifications().await;
            self.store.mark_prompt_shown(PromptKind::Notifications)?;
            log::info!("Notification permission requested, granted: {}", granted);
        }

        if self.profile.needs_battery_exemption
            && !self.provider.battery_optimization_exempt().await
            && !self.store.prompt_shown(PromptKind::BatteryOptimization)?
        {
            let exempt = self.provider.request_battery_exemption().await;
            self.store.mark_prompt_shown(PromptKind::BatteryOptimization)?;
            log::info!("Battery optimization exemption requested, exempt: {}", exempt);
        }

        Ok(self.snapshot().await)
    }

    pub fn scan_mode(&self, snapshot: &CapabilitySnapshot) -> ScanMode {
        if !snapshot.battery_optimization_ok {
            log::warn!("Battery optimization may suspend background scanning");
        }
        if !snapshot.periodic_available() {
            log::warn!(
                "Periodic background fetch is {:?}, no fallback scanning",
                snapshot.background_fetch_status
            );
        }

        if self.profile.needs_notification_permission && !snapshot.notifications_granted {
            log::warn!("Notifications not granted, continuous scanning unavailable");
            return ScanMode::PeriodicOnly;
        }
        ScanMode::Continuous
    }
}
