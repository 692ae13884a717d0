//! State-action assembly.
//!
//! [`DataCollectionRunner::collect_data`] joins a telemetry window with the
//! tracked histories of the requested evaluators:
//!
//! - `Actions` come from record 0 of the window
//! - each `EvalConstant` comes from the evaluator's first tracked call
//! - every record becomes a `Sample` carrying one `EvalMetrics` per evaluator
//!
//! Values taken from index 0 are assumed constant across the window. Entries
//! that disagree are counted and handled per [`DivergencePolicy`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::state_action::{Actions, EvalConstant, Sample, StateActions};
use crate::telemetry::{TelemetryQuery, TelemetryRecord, TelemetrySource, TelemetryTarget};
use crate::tracker::EvaluatorTracker;
use crate::window::TimeWindow;
use crate::{Error, Result};

/// What to do when values assumed window-wide differ between entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// Log a warning and keep the first entry's value.
    #[default]
    Warn,
    /// Fail the assembly with [`Error::Divergent`].
    Reject,
}

/// Joins telemetry windows with tracked evaluator histories.
pub struct DataCollectionRunner {
    tracker: EvaluatorTracker,
    source: Box<dyn TelemetrySource>,
    target: TelemetryTarget,
    divergence: DivergencePolicy,
}

impl DataCollectionRunner {
    pub fn new(
        tracker: EvaluatorTracker,
        source: impl TelemetrySource + 'static,
        target: TelemetryTarget,
    ) -> Self {
        Self {
            tracker,
            source: Box::new(source),
            target,
            divergence: DivergencePolicy::default(),
        }
    }

    pub fn with_divergence_policy(mut self, divergence: DivergencePolicy) -> Self {
        self.divergence = divergence;
        self
    }

    pub fn tracker(&self) -> &EvaluatorTracker {
        &self.tracker
    }

    /// Mutable access for recording further evaluator calls.
    pub fn tracker_mut(&mut self) -> &mut EvaluatorTracker {
        &mut self.tracker
    }

    pub fn target(&self) -> &TelemetryTarget {
        &self.target
    }

    /// Assemble one [`StateActions`] from a window.
    ///
    /// Evaluator histories are checked before telemetry is fetched, so a
    /// missing evaluator never costs a network round trip. The result is
    /// complete or not produced at all.
    #[instrument(name = "collection::collect", skip_all, fields(window = %window, limit = limit))]
    pub async fn collect_data<S: AsRef<str>>(
        &mut self,
        window: TimeWindow,
        evaluator_names: &[S],
        limit: usize,
    ) -> Result<StateActions> {
        if evaluator_names.is_empty() {
            return Err(Error::Configuration(
                "at least one evaluator name is required".to_string(),
            ));
        }
        if limit == 0 {
            return Err(Error::Configuration("limit must be at least 1".to_string()));
        }

        let eval_constants = self.eval_constants(evaluator_names)?;

        let query = TelemetryQuery::new(&self.target, window, limit);
        let mut table = self.source.fetch(&query).await?;
        table.truncate(limit);
        if table.is_empty() {
            return Err(Error::EmptyWindow { window });
        }
        debug!(records = table.len(), "fetched telemetry window");

        let rows = table.rows();
        let first = TelemetryRecord::new(0, &rows[0]);
        let actions = Actions::new(first.system_prompt()?, first.model_name()?);

        let records: Vec<_> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| TelemetryRecord::new(index, row))
            .collect();
        let prompt_drift = records[1..]
            .iter()
            .filter(|r| r.system_prompt().ok().as_deref() != Some(actions.system_prompt.as_str()))
            .count();
        self.check_divergence("system prompt".to_string(), prompt_drift, records.len())?;
        let model_drift = records[1..]
            .iter()
            .filter(|r| r.model_name().ok().as_deref() != Some(actions.model.as_str()))
            .count();
        self.check_divergence("model".to_string(), model_drift, records.len())?;

        let mut samples = Vec::with_capacity(records.len());
        for record in &records {
            let mut chat_history = record.chat_history()?;
            if chat_history.first().is_some_and(|m| m.is_system()) {
                chat_history.remove(0);
            }
            let output_generation = record.output_generation()?;
            let evals = evaluator_names
                .iter()
                .map(|name| record.eval_metrics(name.as_ref()))
                .collect();
            samples.push(Sample {
                chat_history,
                output_generation,
                evals,
            });
        }

        let state_actions = StateActions::new(samples, actions, eval_constants);
        info!(
            id = %state_actions.id,
            samples = state_actions.samples.len(),
            evaluators = state_actions.eval_constants.len(),
            "assembled state-actions"
        );
        Ok(state_actions)
    }

    fn eval_constants<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<EvalConstant>> {
        let mut constants = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let (constant, drift, total) = match self.tracker.get(name)? {
                Some(data) => match data.constant() {
                    Some(constant) => (constant, data.divergent_calls(), data.calls.len()),
                    None => return Err(missing(name)),
                },
                None => return Err(missing(name)),
            };
            self.check_divergence(format!("template/rails of evaluator '{name}'"), drift, total)?;
            constants.push(constant);
        }
        Ok(constants)
    }

    fn check_divergence(&self, field: String, count: usize, total: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        match self.divergence {
            DivergencePolicy::Warn => {
                warn!(%field, count, total, "value assumed constant diverges, using the first entry");
                Ok(())
            }
            DivergencePolicy::Reject => Err(Error::Divergent {
                field,
                count,
                total,
            }),
        }
    }
}

fn missing(name: &str) -> Error {
    Error::MissingEvaluator {
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::{Value, json};
    use sia_models::Message;
    use tempfile::{TempDir, tempdir};

    use crate::table::{Row, Table};
    use crate::tracker::{EvalContext, EvaluatorCall};

    /// Returns a fixed table and counts fetches.
    #[derive(Clone)]
    struct StubTelemetry {
        table: Table,
        fetches: Arc<AtomicUsize>,
    }

    impl StubTelemetry {
        fn new(rows: Vec<Row>) -> Self {
            Self {
                table: Table::new(rows),
                fetches: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TelemetrySource for StubTelemetry {
        async fn fetch(&self, _query: &TelemetryQuery) -> Result<Table> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.table.clone())
        }
    }

    struct FailingTelemetry;

    #[async_trait]
    impl TelemetrySource for FailingTelemetry {
        async fn fetch(&self, _query: &TelemetryQuery) -> Result<Table> {
            Err(Error::Telemetry("export timed out".into()))
        }
    }

    fn record(system: &str, model: &str, user: &str, output: &str) -> Row {
        let value = json!({
            "attributes.llm.input_messages": [
                {"message.role": "system", "message.content": system},
                {"message.role": "user", "message.content": user}
            ],
            "attributes.input.value": json!({
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user}
                ]
            }).to_string(),
            "attributes.llm.output_messages": [
                {"message.role": "assistant", "message.content": output}
            ],
            "attributes.llm.model_name": model,
        });
        match value {
            Value::Object(row) => row,
            _ => unreachable!(),
        }
    }

    fn tracker_with(calls: &[(&str, &str, &[&str])]) -> (TempDir, EvaluatorTracker) {
        let dir = tempdir().unwrap();
        let mut tracker = EvaluatorTracker::open(dir.path()).unwrap();
        for (name, template, rails) in calls {
            let ctx = EvalContext::new(*template, rails.iter().copied());
            tracker
                .record(name, EvaluatorCall::new(Utc::now(), &ctx, Value::Null))
                .unwrap();
        }
        (dir, tracker)
    }

    fn window() -> TimeWindow {
        TimeWindow::trailing(Duration::days(1))
    }

    fn target() -> TelemetryTarget {
        TelemetryTarget::new("model", "space")
    }

    #[tokio::test]
    async fn assembles_state_actions_from_window_and_history() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1", "2", "3"])]);
        let mut first = record("Be concise", "gpt-x", "fix this", "fixed");
        first.insert("eval.fmt.label".into(), json!("3"));
        first.insert("eval.fmt.explanation".into(), json!("fine"));
        let telemetry = StubTelemetry::new(vec![
            first,
            record("Be concise", "gpt-x", "and this", "done"),
        ]);
        let mut runner = DataCollectionRunner::new(tracker, telemetry, target());

        let pair = runner.collect_data(window(), &["fmt"], 2).await.unwrap();

        assert_eq!(pair.actions.system_prompt, "Be concise");
        assert_eq!(pair.actions.model, "gpt-x");
        assert_eq!(pair.samples.len(), 2);
        assert_eq!(
            pair.eval_constants,
            vec![EvalConstant {
                name: "fmt".to_string(),
                eval_template: "T".to_string(),
                eval_rails: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            }]
        );

        let sample = &pair.samples[0];
        assert_eq!(sample.chat_history, vec![Message::user("fix this")]);
        assert_eq!(sample.output_generation, "fixed");
        assert_eq!(sample.evals[0].eval_score, Some(json!("3")));
        assert_eq!(sample.evals[0].eval_reasoning.as_deref(), Some("fine"));

        let unlabeled = &pair.samples[1].evals[0];
        assert_eq!(unlabeled.name, "fmt");
        assert!(unlabeled.eval_score.is_none());
    }

    #[tokio::test]
    async fn eval_constants_follow_request_order() {
        let (_dir, tracker) =
            tracker_with(&[("fmt", "T1", &["1", "2"]), ("tone", "T2", &["calm", "harsh"])]);
        let telemetry = StubTelemetry::new(vec![record("S", "m", "u", "o")]);
        let mut runner = DataCollectionRunner::new(tracker, telemetry, target());

        let pair = runner.collect_data(window(), &["tone", "fmt"], 5).await.unwrap();

        let names: Vec<_> = pair.eval_constants.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tone", "fmt"]);
        let eval_names: Vec<_> = pair.samples[0].evals.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(eval_names, vec!["tone", "fmt"]);
    }

    #[tokio::test]
    async fn empty_name_list_and_zero_limit_are_configuration_errors() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut runner =
            DataCollectionRunner::new(tracker, StubTelemetry::new(vec![]), target());

        let names: [&str; 0] = [];
        assert!(matches!(
            runner.collect_data(window(), &names, 10).await,
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            runner.collect_data(window(), &["fmt"], 0).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn missing_evaluator_fails_before_fetching() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let telemetry = StubTelemetry::new(vec![record("S", "m", "u", "o")]);
        let fetches = telemetry.fetches.clone();
        let mut runner = DataCollectionRunner::new(tracker, telemetry, target());

        let err = runner
            .collect_data(window(), &["fmt", "tone"], 10)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingEvaluator { ref name } if name == "tone"));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn user_first_turn_is_a_shape_error() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let row = match json!({
            "attributes.llm.input_messages": [
                {"message.role": "user", "message.content": "hi"}
            ],
            "attributes.llm.output_messages": [
                {"message.role": "assistant", "message.content": "hello"}
            ],
            "attributes.llm.model_name": "gpt-x"
        }) {
            Value::Object(row) => row,
            _ => unreachable!(),
        };
        let mut runner =
            DataCollectionRunner::new(tracker, StubTelemetry::new(vec![row]), target());

        let err = runner.collect_data(window(), &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::DataShape { record: 0, .. }));
    }

    #[tokio::test]
    async fn empty_window_names_the_window() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut runner =
            DataCollectionRunner::new(tracker, StubTelemetry::new(vec![]), target());
        let window = window();

        let err = runner.collect_data(window, &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::EmptyWindow { window: w } if w == window));
    }

    #[tokio::test]
    async fn telemetry_failures_abort() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut runner = DataCollectionRunner::new(tracker, FailingTelemetry, target());

        let err = runner.collect_data(window(), &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::Telemetry(_)));
    }

    #[tokio::test]
    async fn result_is_truncated_to_limit() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let rows = (0..5).map(|i| record("S", "m", &format!("u{i}"), "o")).collect();
        let mut runner = DataCollectionRunner::new(tracker, StubTelemetry::new(rows), target());

        let pair = runner.collect_data(window(), &["fmt"], 3).await.unwrap();
        assert_eq!(pair.samples.len(), 3);
    }

    #[tokio::test]
    async fn divergent_system_prompts_warn_by_default_and_reject_on_request() {
        let rows = vec![
            record("Be concise", "gpt-x", "a", "b"),
            record("Be verbose", "gpt-x", "c", "d"),
        ];

        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut lenient =
            DataCollectionRunner::new(tracker, StubTelemetry::new(rows.clone()), target());
        let pair = lenient.collect_data(window(), &["fmt"], 10).await.unwrap();
        assert_eq!(pair.actions.system_prompt, "Be concise");

        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut strict = DataCollectionRunner::new(tracker, StubTelemetry::new(rows), target())
            .with_divergence_policy(DivergencePolicy::Reject);
        let err = strict.collect_data(window(), &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::Divergent { count: 1, total: 2, .. }));
    }

    #[tokio::test]
    async fn divergent_evaluator_constants_are_flagged() {
        let (_dir, tracker) =
            tracker_with(&[("fmt", "T", &["1", "2"]), ("fmt", "T-edited", &["1", "2"])]);
        let rows = vec![record("S", "m", "u", "o")];

        let mut strict = DataCollectionRunner::new(tracker, StubTelemetry::new(rows), target())
            .with_divergence_policy(DivergencePolicy::Reject);

        let err = strict.collect_data(window(), &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::Divergent { ref field, .. } if field.contains("fmt")));
    }

    #[tokio::test]
    async fn record_without_output_names_its_index() {
        let (_dir, tracker) = tracker_with(&[("fmt", "T", &["1"])]);
        let mut broken = record("S", "m", "u", "o");
        broken.remove("attributes.llm.output_messages");
        let rows = vec![record("S", "m", "u", "o"), broken];
        let mut runner = DataCollectionRunner::new(tracker, StubTelemetry::new(rows), target());

        let err = runner.collect_data(window(), &["fmt"], 10).await.unwrap_err();
        assert!(matches!(err, Error::DataShape { record: 1, .. }));
    }
}
