//! Configuration for sluice: compiled defaults, an optional JSON settings
//! file, and `SLUICE_*` environment overrides.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    AdmissionSettings, BucketScope, ConsumerSettings, GateSettings, LockSettings, QueueSettings,
    ReleaseMode, SluiceSettings, TelemetrySettings,
};
