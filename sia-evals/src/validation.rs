//! Ephemeral validation of policy checkpoints.
//!
//! Scores the latest checkpointed policy against a recent telemetry window
//! without touching tracked evaluator state:
//!
//! 1. Collect state-actions for one evaluator
//! 2. Load the latest checkpoint
//! 3. Replay every sample's conversation under the checkpoint
//! 4. Judge (original, rewritten) pairs with the window's template and rails
//! 5. Average the labels

use serde::Serialize;
use serde_json::Value;
use sia_models::CompletionProvider;
use tracing::{info, instrument};

use crate::collection::DataCollectionRunner;
use crate::judge::{ClassifyRequest, Judge, LABEL_COLUMN};
use crate::policy::CheckpointStore;
use crate::replay::{ReplayOutcome, replay_samples};
use crate::state_action::{Actions, EvalConstant, StateActions};
use crate::table::{Row, Table};
use crate::window::TimeWindow;
use crate::{Error, Result};

/// Judge input column holding the first user turn of a sample.
pub const ORIGINAL_TEXT: &str = "ORIGINAL_TEXT";
/// Judge input column holding the regenerated output.
pub const REWRITTEN_TEXT: &str = "REWRITTEN_TEXT";

/// A sample whose regeneration failed and was left out of judging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayFailure {
    /// Index of the sample in the collected state-actions.
    pub sample: usize,
    pub error: String,
}

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Mean judge label over the scored samples.
    pub average_score: f64,
    /// Judge output, one row per scored sample.
    pub evaluations: Table,
    /// The checkpoint that was validated.
    pub actions: Actions,
    pub failures: Vec<ReplayFailure>,
}

/// Scores checkpoints by replaying recent traffic.
pub struct EphemeralValidator {
    runner: DataCollectionRunner,
    checkpoints: Box<dyn CheckpointStore>,
    provider: Box<dyn CompletionProvider>,
    judge: Box<dyn Judge>,
    judge_model: String,
}

impl EphemeralValidator {
    pub fn new(
        runner: DataCollectionRunner,
        checkpoints: impl CheckpointStore + 'static,
        provider: impl CompletionProvider + 'static,
        judge: impl Judge + 'static,
        judge_model: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            checkpoints: Box::new(checkpoints),
            provider: Box::new(provider),
            judge: Box::new(judge),
            judge_model: judge_model.into(),
        }
    }

    pub fn runner_mut(&mut self) -> &mut DataCollectionRunner {
        &mut self.runner
    }

    /// Validate the latest checkpoint against `window`.
    ///
    /// Failed regenerations are reported, not fatal. The judge call is
    /// all-or-nothing.
    #[instrument(name = "validation::run", skip_all, fields(window = %window, evaluator = evaluator_name))]
    pub async fn run_validation(
        &mut self,
        window: TimeWindow,
        evaluator_name: &str,
        limit: usize,
    ) -> Result<ValidationReport> {
        let state_actions = self
            .runner
            .collect_data(window, &[evaluator_name], limit)
            .await?;
        let actions = self.checkpoints.load_latest()?;
        let constant = state_actions
            .eval_constant(evaluator_name)
            .cloned()
            .ok_or_else(|| Error::MissingEvaluator {
                name: evaluator_name.to_string(),
            })?;

        let (pairs, failures) = self.generate_samples(&actions, &state_actions).await;
        if pairs.is_empty() {
            return Err(Error::NoScorableSamples(format!(
                "all {} regenerations failed",
                failures.len()
            )));
        }

        let evaluations = self.evaluate_samples(pairs, &constant).await?;
        let average_score = calculate_average_score(&evaluations)?;

        info!(
            average_score,
            scored = evaluations.len(),
            failed = failures.len(),
            "validated checkpoint"
        );
        Ok(ValidationReport {
            average_score,
            evaluations,
            actions,
            failures,
        })
    }

    /// Regenerate every sample under `actions`.
    ///
    /// Returns judge-ready pairs for the successful samples and the failures.
    pub async fn generate_samples(
        &self,
        actions: &Actions,
        state_actions: &StateActions,
    ) -> (Table, Vec<ReplayFailure>) {
        let histories: Vec<_> = state_actions
            .samples
            .iter()
            .map(|sample| sample.systemless_history())
            .collect();
        let outcomes = replay_samples(self.provider.as_ref(), actions, &histories).await;

        let mut pairs = Table::default();
        let mut failures = Vec::new();
        for (index, (sample, outcome)) in state_actions.samples.iter().zip(outcomes).enumerate() {
            match outcome {
                ReplayOutcome::Generated { text, .. } => {
                    let mut row = Row::new();
                    row.insert(
                        ORIGINAL_TEXT.to_string(),
                        Value::String(sample.first_user_turn().unwrap_or_default().to_string()),
                    );
                    row.insert(REWRITTEN_TEXT.to_string(), Value::String(text));
                    pairs.push(row);
                }
                ReplayOutcome::Failed { error } => failures.push(ReplayFailure {
                    sample: index,
                    error,
                }),
            }
        }
        (pairs, failures)
    }

    /// Judge pairs with an evaluator's template and rails.
    pub async fn evaluate_samples(&self, pairs: Table, constant: &EvalConstant) -> Result<Table> {
        let request = ClassifyRequest::new(
            pairs,
            self.judge_model.clone(),
            constant.eval_template.clone(),
            constant.eval_rails.clone(),
        );
        self.judge.classify(request).await
    }
}

/// Mean of the numeric `label` column.
///
/// Labels may be numbers or numeric strings; anything else is a shape error
/// naming the row.
pub fn calculate_average_score(evaluations: &Table) -> Result<f64> {
    if evaluations.is_empty() {
        return Err(Error::NoScorableSamples(
            "no evaluation rows to average".to_string(),
        ));
    }

    let mut total = 0.0;
    for (index, label) in evaluations.column(LABEL_COLUMN).enumerate() {
        total += label_score(index, label)?;
    }
    Ok(total / evaluations.len() as f64)
}

fn label_score(index: usize, label: Option<&Value>) -> Result<f64> {
    let score = match label {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match score {
        Some(score) if score.is_finite() => Ok(score),
        _ => Err(Error::shape(
            index,
            match label {
                Some(value) => format!("label {value} is not numeric"),
                None => format!("missing {LABEL_COLUMN}"),
            },
        )),
    }
}
