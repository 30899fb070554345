//! Presence state machine
//!
//! ```text
//!   Outside ──geofence enter──► InsideArea ──rssi ≥ enter──► Present
//!      ▲                          ▲     ▲                    │   ▲
//!      │                          │     │            rssi < exit  rssi ≥ enter
//!      │                 debounce/watchdog/ttl               ▼   │
//!      │                          └──────────────────── Unconfirmed
//!      └──────────── geofence exit (from any state) ────────────┘
//! ```

pub mod hysteresis;
pub mod session;

pub use hysteresis::{classify, SignalVerdict, Thresholds};
pub use session::{PresenceSession, Transition};

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Errors raised by session operations
#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Store error: {0}")]
    Store(#[from] PersistenceError),
}
