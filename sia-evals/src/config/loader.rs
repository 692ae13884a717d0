use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::{
    CollectionConfig, JudgeConfig, ProviderConfig, RawCollectionConfig, RawJudgeConfig,
    RawSiaConfig, RawTelemetryConfig, RawTrackerConfig, SiaConfig, TelemetryConfig, TrackerConfig,
    DEFAULT_JUDGE_MODEL, DEFAULT_TELEMETRY_LIMIT,
};
use crate::{Error, Result};

/// Environment variable overriding the project config directory.
pub const PROJECT_CONFIG_DIR_ENV: &str = "SIA_PROJECT_CONFIG_DIR";
/// Environment variable overriding `telemetry.model_id`.
pub const MODEL_ID_ENV: &str = "ARIZE_MODEL_ID";
/// Environment variable overriding `telemetry.space_id`.
pub const SPACE_ID_ENV: &str = "ARIZE_SPACE_ID";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project + environment)
    pub fn load() -> Result<SiaConfig> {
        Self::load_layers(
            Some(&Self::user_config_path()),
            &Self::project_config_path(),
            |key| std::env::var(key).ok(),
        )
    }

    /// Load from explicit files, then apply environment overrides via `env`.
    ///
    /// Missing files are skipped; unreadable or invalid files are errors.
    pub fn load_layers(
        user_path: Option<&Path>,
        project_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<SiaConfig> {
        let mut raw = RawSiaConfig::default();

        // Layer 1: User config
        if let Some(user_path) = user_path
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(user_path)?);
        }

        // Layer 2: Project config
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(project_path)?);
        }

        // Layer 3: Environment
        raw = Self::apply_env(raw, env);

        Ok(Self::finalize(raw))
    }

    /// Get user config path (`$XDG_CONFIG_HOME/sia/config.toml`)
    pub fn user_config_path() -> PathBuf {
        sia_paths::config_dir().join("config.toml")
    }

    /// Get project config path
    /// Can be overridden with SIA_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        match std::env::var(PROJECT_CONFIG_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir).join("config.toml"),
            Err(_) => PathBuf::from(sia_paths::DEFAULT_STATE_DIR).join("config.toml"),
        }
    }

    /// Save config to a specific path
    ///
    /// Creates parent directories if they don't exist.
    pub fn save_to_path(config: &SiaConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let toml = toml::to_string_pretty(config)
            .map_err(|e| Error::Configuration(format!("cannot encode config: {e}")))?;
        std::fs::write(path, toml).map_err(|e| Error::io(path, e))?;

        Ok(())
    }

    fn read_raw(path: &Path) -> Result<RawSiaConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let raw = toml::from_str(&contents).map_err(|e| Error::schema(path, e))?;
        debug!(path = %path.display(), "loaded config layer");
        Ok(raw)
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawSiaConfig, overlay: RawSiaConfig) -> RawSiaConfig {
        RawSiaConfig {
            state_dir: overlay.state_dir.or(base.state_dir),
            telemetry: RawTelemetryConfig {
                model_id: overlay.telemetry.model_id.or(base.telemetry.model_id),
                space_id: overlay.telemetry.space_id.or(base.telemetry.space_id),
                default_limit: overlay
                    .telemetry
                    .default_limit
                    .or(base.telemetry.default_limit),
            },
            judge: RawJudgeConfig {
                model: overlay.judge.model.or(base.judge.model),
                temperature: overlay.judge.temperature.or(base.judge.temperature),
            },
            provider: ProviderConfig {
                base_url: overlay.provider.base_url.or(base.provider.base_url),
            },
            collection: RawCollectionConfig {
                divergence: overlay.collection.divergence.or(base.collection.divergence),
            },
            tracker: RawTrackerConfig {
                persistence: overlay.tracker.persistence.or(base.tracker.persistence),
            },
        }
    }

    /// Non-empty environment values win over files
    fn apply_env(mut raw: RawSiaConfig, env: impl Fn(&str) -> Option<String>) -> RawSiaConfig {
        let set = |key: &str| env(key).filter(|v| !v.is_empty());
        if let Some(model_id) = set(MODEL_ID_ENV) {
            raw.telemetry.model_id = Some(model_id);
        }
        if let Some(space_id) = set(SPACE_ID_ENV) {
            raw.telemetry.space_id = Some(space_id);
        }
        raw
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawSiaConfig) -> SiaConfig {
        SiaConfig {
            state_dir: raw.state_dir.unwrap_or_else(sia_paths::state_dir),
            telemetry: TelemetryConfig {
                model_id: raw.telemetry.model_id,
                space_id: raw.telemetry.space_id,
                default_limit: raw
                    .telemetry
                    .default_limit
                    .unwrap_or(DEFAULT_TELEMETRY_LIMIT),
            },
            judge: JudgeConfig {
                model: raw
                    .judge
                    .model
                    .unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
                temperature: raw.judge.temperature.unwrap_or(0.0),
            },
            provider: raw.provider,
            collection: CollectionConfig {
                divergence: raw.collection.divergence.unwrap_or_default(),
            },
            tracker: TrackerConfig {
                persistence: raw.tracker.persistence.unwrap_or_default(),
            },
        }
    }
}
