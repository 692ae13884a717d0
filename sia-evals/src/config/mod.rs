//! Layered configuration.
//!
//! Defaults, then the user file (`$XDG_CONFIG_HOME/sia/config.toml`), then
//! the project file (`.sia/config.toml`), then `ARIZE_MODEL_ID` /
//! `ARIZE_SPACE_ID` from the environment.

mod loader;
mod types;

pub use loader::{ConfigLoader, MODEL_ID_ENV, PROJECT_CONFIG_DIR_ENV, SPACE_ID_ENV};
pub use types::{
    CREDENTIAL_SERVICE, CollectionConfig, DEFAULT_JUDGE_MODEL, DEFAULT_TELEMETRY_LIMIT,
    JudgeConfig, ProviderConfig, SiaConfig, TelemetryConfig, TrackerConfig,
};
