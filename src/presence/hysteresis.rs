//! Two-threshold RSSI classification
//!
//! `enter` is strictly greater than `exit`; readings in between never
//! change state, which keeps presence from flapping around a single
//! boundary.

use crate::models::AppState;

/// Hysteresis thresholds in dBm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub enter: i16,
    pub exit: i16,
}

impl Thresholds {
    /// Returns `None` unless `enter > exit`
    pub fn new(enter: i16, exit: i16) -> Option<Self> {
        if enter > exit {
            Some(Thresholds { enter, exit })
        } else {
            None
        }
    }

    pub fn qualifies(&self, rssi: f64) -> bool {
        rssi >= f64::from(self.enter)
    }

    pub fn is_lost(&self, rssi: f64) -> bool {
        rssi < f64::from(self.exit)
    }
}

/// Where a smoothed reading moves the state machine, if anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVerdict {
    /// Enter `Present` (from `InsideArea`)
    Confirm,
    /// Back to `Present` from `Unconfirmed`, cancelling the debounce
    Requalify,
    /// `Present` to `Unconfirmed`, arming the debounce
    Lose,
    Hold,
}

pub fn classify(state: AppState, smoothed: f64, thresholds: &Thresholds) -> SignalVerdict {
    match state {
        AppState::InsideArea if thresholds.qualifies(smoothed) => SignalVerdict::Confirm,
        AppState::Unconfirmed if thresholds.qualifies(smoothed) => SignalVerdict::Requalify,
        AppState::Present if thresholds.is_lost(smoothed) => SignalVerdict::Lose,
        _ => SignalVerdict::Hold,
    }
}
