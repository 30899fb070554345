pub mod app;
pub mod attendance;
pub mod capability;
pub mod config;
pub mod detection;
pub mod geofence;
pub mod host;
pub mod input;
pub mod models;
pub mod output;
pub mod persistence;
pub mod platform;
pub mod presence;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use app::{AppError, PresenceApp};
pub use attendance::{AttendanceEvent, AttendanceKind, AttendanceReporter, AttendanceSink};
pub use config::Config;
pub use detection::{ContinuousScanner, PeriodicTask};
pub use geofence::{GeofenceBridge, GeofenceEvent, GeofenceTransition, Region};
pub use models::{Advertisement, AppState, Detection, PresenceRecord, StateChange, TransitionCause};
pub use persistence::{PresenceStore, SqlitePresenceStore};
pub use platform::PlatformProfile;
pub use presence::{PresenceSession, Thresholds};
