use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sia_models::CompletionProvider;
use sia_models::auth::CredentialStore;
use sia_models::providers::OpenAiProvider;

use crate::collection::DivergencePolicy;
use crate::judge::LlmJudge;
use crate::policy::FileCheckpointStore;
use crate::telemetry::TelemetryTarget;
use crate::tracker::{EvaluatorTracker, Persistence};
use crate::{Error, Result};

/// Keyring service credentials are stored under.
pub const CREDENTIAL_SERVICE: &str = "sia";

/// Default maximum number of telemetry records per window.
pub const DEFAULT_TELEMETRY_LIMIT: usize = 100;

/// Default model the judge classifies with.
pub const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSiaConfig {
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub telemetry: RawTelemetryConfig,

    #[serde(default)]
    pub judge: RawJudgeConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub collection: RawCollectionConfig,

    #[serde(default)]
    pub tracker: RawTrackerConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTelemetryConfig {
    pub model_id: Option<String>,
    pub space_id: Option<String>,
    pub default_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawJudgeConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCollectionConfig {
    pub divergence: Option<DivergencePolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTrackerConfig {
    pub persistence: Option<Persistence>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiaConfig {
    /// Root of evaluator histories and checkpoints.
    pub state_dir: PathBuf,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for SiaConfig {
    fn default() -> Self {
        Self {
            state_dir: sia_paths::state_dir(),
            telemetry: TelemetryConfig::default(),
            judge: JudgeConfig::default(),
            provider: ProviderConfig::default(),
            collection: CollectionConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl SiaConfig {
    pub fn evaluators_dir(&self) -> PathBuf {
        self.state_dir.join(sia_paths::EVALUATORS_DIR)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join(sia_paths::CHECKPOINT_DIR)
    }

    /// Tracker over this config's evaluator directory.
    pub fn open_tracker(&self) -> Result<EvaluatorTracker> {
        Ok(EvaluatorTracker::open(self.evaluators_dir())?.with_persistence(self.tracker.persistence))
    }

    pub fn open_checkpoint_store(&self) -> Result<FileCheckpointStore> {
        FileCheckpointStore::open(self.checkpoint_dir())
    }

    /// Completion provider keyed from the keyring or `OPENAI_API_KEY`.
    pub fn openai_provider(&self, credentials: &CredentialStore) -> Result<OpenAiProvider> {
        let key = credentials.get("openai").map_err(|e| match e {
            sia_models::Error::CredentialsNotFound(provider) => Error::Configuration(format!(
                "no API key for {provider}, set OPENAI_API_KEY or store one in the keyring"
            )),
            other => Error::Provider(other),
        })?;
        let provider = OpenAiProvider::new(key);
        Ok(match &self.provider.base_url {
            Some(base_url) => provider.with_base_url(base_url.clone()),
            None => provider,
        })
    }

    /// Judge using this config's temperature.
    pub fn llm_judge<P: CompletionProvider>(&self, provider: P) -> LlmJudge<P> {
        LlmJudge::new(provider).with_temperature(self.judge.temperature)
    }

    /// Keyring-backed credentials with environment fallback.
    pub fn credentials() -> CredentialStore {
        CredentialStore::new(CREDENTIAL_SERVICE).with_env_fallback()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry project (model) id
    pub model_id: Option<String>,

    /// Telemetry space id
    pub space_id: Option<String>,

    /// Records per window when the caller gives no limit
    pub default_limit: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            space_id: None,
            default_limit: DEFAULT_TELEMETRY_LIMIT,
        }
    }
}

impl TelemetryConfig {
    /// The configured telemetry project.
    ///
    /// Both ids are required.
    pub fn target(&self) -> Result<TelemetryTarget> {
        let model_id = non_empty(&self.model_id).ok_or_else(|| {
            Error::Configuration("telemetry model id is not set (ARIZE_MODEL_ID)".to_string())
        })?;
        let space_id = non_empty(&self.space_id).ok_or_else(|| {
            Error::Configuration("telemetry space id is not set (ARIZE_SPACE_ID)".to_string())
        })?;
        Ok(TelemetryTarget::new(model_id, space_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Model used for classification
    pub model: String,

    /// Sampling temperature for classification
    pub temperature: f32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_JUDGE_MODEL.to_string(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// OpenAI-compatible endpoint; the public API when unset
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CollectionConfig {
    pub divergence: DivergencePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackerConfig {
    pub persistence: Persistence,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
