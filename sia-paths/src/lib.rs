//! Directory layout for sia.
//!
//! Evaluator histories and policy checkpoints live in a process-local state
//! directory (`.sia` in the working directory by default). User-level
//! configuration follows XDG paths, matching tools like gh and kubectl.

use std::path::PathBuf;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "SIA_STATE_DIR";

/// Name of the default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".sia";

/// Subdirectory of the state directory holding evaluator histories.
pub const EVALUATORS_DIR: &str = "evaluators";

/// Subdirectory of the state directory holding policy checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// Get the sia state directory.
///
/// Returns `$SIA_STATE_DIR` if set, otherwise `./.sia`.
///
/// # Examples
///
/// ```
/// use sia_paths::state_dir;
///
/// let state = state_dir();
/// let evaluators = state.join("evaluators");
/// ```
pub fn state_dir() -> PathBuf {
    match std::env::var(STATE_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_STATE_DIR),
    }
}

/// Directory holding one history file per tracked evaluator.
pub fn evaluators_dir() -> PathBuf {
    state_dir().join(EVALUATORS_DIR)
}

/// Directory holding policy checkpoints.
pub fn checkpoint_dir() -> PathBuf {
    state_dir().join(CHECKPOINT_DIR)
}

/// Get the sia config directory.
///
/// Returns `$XDG_CONFIG_HOME/sia` if set, otherwise `~/.config/sia`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("sia")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config/sia")
    } else {
        PathBuf::from(".config/sia")
    }
}
