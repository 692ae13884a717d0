//! Policy updates and checkpoints.
//!
//! A [`PolicyUpdater`] proposes new [`Actions`] from a [`StateActions`]; a
//! [`CheckpointStore`] keeps every proposal so validation and replay can pick
//! up the latest one.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::state_action::{Actions, StateActions};
use crate::types::CheckpointId;
use crate::{Error, Result};

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".json";

/// Persisted snapshots of the policy.
pub trait CheckpointStore: Send + Sync {
    /// The most recently saved policy.
    fn load_latest(&self) -> Result<Actions>;

    /// Persist a policy, returning its id.
    fn save(&self, actions: &Actions) -> Result<CheckpointId>;
}

/// Proposes a new policy from collected state-action data.
#[async_trait]
pub trait PolicyUpdater: Send + Sync {
    async fn update(&self, state_actions: &StateActions) -> Result<Actions>;
}

/// Run `updater` and checkpoint the policy it proposes.
pub async fn update_and_checkpoint<U, C>(
    updater: &U,
    store: &C,
    state_actions: &StateActions,
) -> Result<(CheckpointId, Actions)>
where
    U: PolicyUpdater + ?Sized,
    C: CheckpointStore + ?Sized,
{
    let actions = updater.update(state_actions).await?;
    let id = store.save(&actions)?;
    info!(checkpoint = %id, state_actions = %state_actions.id, model = %actions.model, "checkpointed policy");
    Ok((id, actions))
}

/// Checkpoints as `checkpoint-<id>.json` files in one directory.
///
/// Ids are UUIDv7, so the greatest id is the newest checkpoint.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Store under the default state directory.
    pub fn open_default() -> Result<Self> {
        Self::open(sia_paths::checkpoint_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self, id: CheckpointId) -> PathBuf {
        self.dir
            .join(format!("{CHECKPOINT_PREFIX}{id}{CHECKPOINT_SUFFIX}"))
    }

    /// Ids of every stored checkpoint, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointId>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|name| name.strip_suffix(CHECKPOINT_SUFFIX))
            else {
                continue;
            };
            match Uuid::parse_str(stem) {
                Ok(uuid) => ids.push(CheckpointId(uuid)),
                Err(_) => debug!(file = ?file_name, "skipping file that is not a checkpoint"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: CheckpointId) -> Result<Actions> {
        let path = self.checkpoint_path(id);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| Error::schema(&path, e))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load_latest(&self) -> Result<Actions> {
        let latest = self.list()?.pop().ok_or_else(|| Error::NoCheckpoint {
            dir: self.dir.clone(),
        })?;
        debug!(checkpoint = %latest, "loading latest checkpoint");
        self.load(latest)
    }

    fn save(&self, actions: &Actions) -> Result<CheckpointId> {
        let id = CheckpointId::new();
        let path = self.checkpoint_path(id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(actions)?;
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::state_action::EvalConstant;

    /// Appends a fixed instruction to the current system prompt.
    struct AppendInstruction(&'static str);

    #[async_trait]
    impl PolicyUpdater for AppendInstruction {
        async fn update(&self, state_actions: &StateActions) -> Result<Actions> {
            Ok(Actions::new(
                format!("{} {}", state_actions.actions.system_prompt, self.0),
                state_actions.actions.model.clone(),
            ))
        }
    }

    #[test]
    fn empty_store_has_no_checkpoint() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        assert!(matches!(store.load_latest(), Err(Error::NoCheckpoint { .. })));
    }

    #[test]
    fn latest_checkpoint_wins() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        let first = store.save(&Actions::new("v1", "gpt-x")).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = store.save(&Actions::new("v2", "gpt-y")).unwrap();

        assert!(second > first);
        assert_eq!(store.list().unwrap(), vec![first, second]);
        assert_eq!(store.load_latest().unwrap(), Actions::new("v2", "gpt-y"));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("checkpoint-latest.json"), "{}").unwrap();

        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_checkpoint_is_a_schema_error() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        let id = CheckpointId::new();
        std::fs::write(store.checkpoint_path(id), "{\"system_prompt\": 1}").unwrap();

        assert!(matches!(store.load_latest(), Err(Error::Schema { .. })));
    }

    #[tokio::test]
    async fn update_and_checkpoint_persists_the_proposal() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        let state_actions = StateActions::new(
            Vec::new(),
            Actions::new("Be concise.", "gpt-x"),
            vec![EvalConstant {
                name: "fmt".to_string(),
                eval_template: "T".to_string(),
                eval_rails: vec!["1".to_string()],
            }],
        );

        let (id, actions) =
            update_and_checkpoint(&AppendInstruction("Use bullet points."), &store, &state_actions)
                .await
                .unwrap();

        assert_eq!(actions.system_prompt, "Be concise. Use bullet points.");
        assert_eq!(store.load(id).unwrap(), actions);
        assert_eq!(store.load_latest().unwrap(), actions);
    }
}
