//! Policy environment: replay recorded traffic under the current checkpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sia_models::{CompletionProvider, Usage};
use tracing::{info, instrument};

use crate::collection::DataCollectionRunner;
use crate::policy::CheckpointStore;
use crate::replay::{ReplayOutcome, replay_samples};
use crate::state_action::StateActions;
use crate::types::RunId;
use crate::window::TimeWindow;
use crate::Result;

/// Per-sample result of an emulation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmulatedSample {
    Completed { usage: Usage, response_length: usize },
    Failed { error: String },
}

impl From<ReplayOutcome> for EmulatedSample {
    fn from(outcome: ReplayOutcome) -> Self {
        match outcome {
            ReplayOutcome::Generated { text, usage } => Self::Completed {
                usage,
                response_length: text.chars().count(),
            },
            ReplayOutcome::Failed { error } => Self::Failed { error },
        }
    }
}

/// Summary of replaying every sample of a [`StateActions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmulationReport {
    pub run_id: RunId,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub samples: Vec<EmulatedSample>,
    /// Text of the last successful completion.
    pub last_content: Option<String>,
}

impl EmulationReport {
    /// Token usage summed over completed samples.
    pub fn total_usage(&self) -> Usage {
        self.samples
            .iter()
            .filter_map(|sample| match sample {
                EmulatedSample::Completed { usage, .. } => Some(*usage),
                EmulatedSample::Failed { .. } => None,
            })
            .fold(Usage::default(), |total, usage| Usage {
                prompt_tokens: total.prompt_tokens + usage.prompt_tokens,
                completion_tokens: total.completion_tokens + usage.completion_tokens,
                total_tokens: total.total_tokens + usage.total_tokens,
            })
    }

    pub fn failures(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| matches!(s, EmulatedSample::Failed { .. }))
            .count()
    }
}

/// Collects state-actions under the latest checkpoint and replays them.
pub struct PolicyEnvironment {
    runner: DataCollectionRunner,
    checkpoints: Box<dyn CheckpointStore>,
    provider: Box<dyn CompletionProvider>,
}

impl PolicyEnvironment {
    pub fn new(
        runner: DataCollectionRunner,
        checkpoints: impl CheckpointStore + 'static,
        provider: impl CompletionProvider + 'static,
    ) -> Self {
        Self {
            runner,
            checkpoints: Box::new(checkpoints),
            provider: Box::new(provider),
        }
    }

    pub fn runner_mut(&mut self) -> &mut DataCollectionRunner {
        &mut self.runner
    }

    /// Collect a window, then swap its actions for the latest checkpoint.
    pub async fn collect_updated_state_actions<S: AsRef<str>>(
        &mut self,
        window: TimeWindow,
        evaluator_names: &[S],
        limit: usize,
    ) -> Result<StateActions> {
        let mut state_actions = self
            .runner
            .collect_data(window, evaluator_names, limit)
            .await?;
        state_actions.actions = self.checkpoints.load_latest()?;
        Ok(state_actions)
    }

    /// Replay every sample with `state_actions.actions`.
    ///
    /// Individual failures are reported per sample; the run never aborts.
    #[instrument(name = "environment::emulate", skip_all, fields(model = %state_actions.actions.model))]
    pub async fn emulate(&self, state_actions: &StateActions) -> EmulationReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let clock = Instant::now();

        let histories: Vec<_> = state_actions
            .samples
            .iter()
            .map(|sample| sample.chat_history.clone())
            .collect();
        let outcomes =
            replay_samples(self.provider.as_ref(), &state_actions.actions, &histories).await;

        let last_content = outcomes
            .iter()
            .rev()
            .find_map(|o| o.text().map(str::to_string));
        let samples: Vec<EmulatedSample> = outcomes.into_iter().map(Into::into).collect();
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = EmulationReport {
            run_id,
            model: state_actions.actions.model.clone(),
            started_at,
            duration_ms,
            samples,
            last_content,
        };
        info!(
            run_id = %report.run_id,
            samples = report.samples.len(),
            failed = report.failures(),
            duration_ms,
            "emulation finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::{Value, json};
    use sia_models::providers::StopReason;
    use sia_models::{ChatRequest, ChatResponse, Message};
    use tempfile::{TempDir, tempdir};

    use crate::policy::FileCheckpointStore;
    use crate::state_action::{Actions, Sample};
    use crate::table::{Row, Table};
    use crate::telemetry::{TelemetryQuery, TelemetrySource, TelemetryTarget};
    use crate::tracker::{EvalContext, EvaluatorCall, EvaluatorTracker};

    struct OneWindow(Table);

    #[async_trait]
    impl TelemetrySource for OneWindow {
        async fn fetch(&self, _query: &TelemetryQuery) -> Result<Table> {
            Ok(self.0.clone())
        }
    }

    /// Echoes the system prompt; fails on empty user turns.
    struct EchoSystem;

    #[async_trait]
    impl CompletionProvider for EchoSystem {
        fn name(&self) -> &str {
            "echo-system"
        }

        async fn complete(&self, request: ChatRequest) -> sia_models::Result<ChatResponse> {
            let user = request.messages.last().map(|m| m.content.as_str()).unwrap_or("");
            if user.is_empty() {
                return Err(sia_models::Error::ProviderApi("empty prompt".into()));
            }
            Ok(ChatResponse {
                text: request.messages[0].content.clone(),
                stop_reason: StopReason::EndTurn,
                usage: Usage::new(4, 2),
            })
        }
    }

    fn row() -> Row {
        match json!({
            "attributes.llm.input_messages": [
                {"message.role": "system", "message.content": "Recorded prompt"},
                {"message.role": "user", "message.content": "hello"}
            ],
            "attributes.llm.output_messages": [
                {"message.role": "assistant", "message.content": "hi"}
            ],
            "attributes.llm.model_name": "gpt-x"
        }) {
            Value::Object(row) => row,
            _ => unreachable!(),
        }
    }

    fn environment(checkpoint: Option<Actions>) -> (TempDir, PolicyEnvironment) {
        let dir = tempdir().unwrap();
        let mut tracker = EvaluatorTracker::open(dir.path().join("evaluators")).unwrap();
        tracker
            .record(
                "fmt",
                EvaluatorCall::new(Utc::now(), &EvalContext::new("T", ["1", "2"]), Value::Null),
            )
            .unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoint")).unwrap();
        if let Some(actions) = checkpoint {
            store.save(&actions).unwrap();
        }
        let runner = DataCollectionRunner::new(
            tracker,
            OneWindow(Table::new(vec![row(), row()])),
            TelemetryTarget::new("model", "space"),
        );
        (dir, PolicyEnvironment::new(runner, store, EchoSystem))
    }

    #[tokio::test]
    async fn collected_actions_come_from_the_checkpoint() {
        let (_dir, mut env) = environment(Some(Actions::new("Checkpoint prompt", "gpt-y")));

        let state_actions = env
            .collect_updated_state_actions(TimeWindow::trailing(Duration::hours(6)), &["fmt"], 10)
            .await
            .unwrap();

        assert_eq!(state_actions.actions, Actions::new("Checkpoint prompt", "gpt-y"));
        assert_eq!(state_actions.samples.len(), 2);
    }

    #[tokio::test]
    async fn missing_checkpoint_fails_collection() {
        let (_dir, mut env) = environment(None);
        let err = env
            .collect_updated_state_actions(TimeWindow::trailing(Duration::hours(6)), &["fmt"], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NoCheckpoint { .. }));
    }

    #[tokio::test]
    async fn emulate_reports_usage_and_failures_per_sample() {
        let (_dir, env) = environment(None);
        let sample = |user: &str| Sample {
            chat_history: vec![Message::user(user)],
            output_generation: String::new(),
            evals: Vec::new(),
        };
        let state_actions = StateActions::new(
            vec![sample("one"), sample(""), sample("three")],
            Actions::new("Be brief", "gpt-y"),
            Vec::new(),
        );

        let report = env.emulate(&state_actions).await;

        assert_eq!(report.model, "gpt-y");
        assert_eq!(report.samples.len(), 3);
        assert_eq!(report.failures(), 1);
        assert_eq!(
            report.samples[0],
            EmulatedSample::Completed {
                usage: Usage::new(4, 2),
                response_length: "Be brief".len(),
            }
        );
        assert!(matches!(report.samples[1], EmulatedSample::Failed { .. }));
        assert_eq!(report.total_usage(), Usage::new(8, 4));
        assert_eq!(report.last_content.as_deref(), Some("Be brief"));
    }
}
