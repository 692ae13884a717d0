//! LLM-as-judge classification.
//!
//! A [`Judge`] labels every row of a table against a template and a closed
//! set of rails. [`LlmJudge`] implements it on top of any completion provider;
//! [`JudgeEvaluator`] exposes a judge as an [`Evaluator`] so its invocations
//! can be tracked.

use async_trait::async_trait;
use serde_json::Value;
use sia_models::{ChatRequest, CompletionProvider, Message};
use tracing::{debug, info};

use crate::table::{Row, Table};
use crate::tracker::{EvalContext, Evaluator};
use crate::{Error, Result};

/// Label assigned when a response cannot be mapped onto the rails.
pub const NOT_PARSABLE: &str = "NOT_PARSABLE";
/// Output column holding the assigned label.
pub const LABEL_COLUMN: &str = "label";
/// Output column holding the judge's reasoning.
pub const EXPLANATION_COLUMN: &str = "explanation";
/// Context table a [`JudgeEvaluator`] classifies.
pub const DATAFRAME_KEY: &str = "dataframe";

/// Rows to classify and how to classify them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    pub rows: Table,
    pub model: String,
    /// Prompt with `{COLUMN}` placeholders filled from each row.
    pub template: String,
    pub rails: Vec<String>,
    pub provide_explanation: bool,
}

impl ClassifyRequest {
    /// Request with explanations enabled.
    pub fn new(
        rows: Table,
        model: impl Into<String>,
        template: impl Into<String>,
        rails: Vec<String>,
    ) -> Self {
        Self {
            rows,
            model: model.into(),
            template: template.into(),
            rails,
            provide_explanation: true,
        }
    }

    pub fn without_explanation(mut self) -> Self {
        self.provide_explanation = false;
        self
    }
}

/// Scores rows against a template and rails.
///
/// Output rows align with input rows and carry [`LABEL_COLUMN`] plus, when
/// requested, [`EXPLANATION_COLUMN`]. A failure on any row fails the batch.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn classify(&self, request: ClassifyRequest) -> Result<Table>;
}

/// A [`Judge`] that asks a language model for each label.
pub struct LlmJudge<P> {
    provider: P,
    temperature: f32,
}

impl<P: CompletionProvider> LlmJudge<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P: CompletionProvider> Judge for LlmJudge<P> {
    async fn classify(&self, request: ClassifyRequest) -> Result<Table> {
        let mut labeled = Table::default();
        for (index, row) in request.rows.rows().iter().enumerate() {
            let prompt = classification_prompt(
                &render_template(&request.template, row),
                &request.rails,
                request.provide_explanation,
            );
            let chat = ChatRequest::new(request.model.clone(), vec![Message::user(prompt)])
                .temperature(self.temperature);
            let response = self
                .provider
                .complete(chat)
                .await
                .map_err(|e| Error::Judge(format!("row {index}: {e}")))?;

            let (label, explanation) =
                parse_response(&response.text, &request.rails, request.provide_explanation);
            if label == NOT_PARSABLE {
                debug!(row = index, response = %response.text, "judge response off the rails");
            }

            let mut out = Row::new();
            out.insert(LABEL_COLUMN.to_string(), Value::String(label));
            if request.provide_explanation {
                out.insert(
                    EXPLANATION_COLUMN.to_string(),
                    explanation.map_or(Value::Null, Value::String),
                );
            }
            labeled.push(out);
        }
        info!(
            provider = self.provider.name(),
            model = %request.model,
            rows = labeled.len(),
            "classified rows"
        );
        Ok(labeled)
    }
}

/// Fill `{COLUMN}` placeholders from a row.
///
/// The template is scanned once; substituted values are never rescanned, so
/// braces inside row values come through verbatim. Placeholders without a
/// matching column are left untouched.
pub fn render_template(template: &str, row: &Row) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        let close = tail[1..].find(['{', '}']).map(|at| at + 1);
        match close {
            Some(close) if tail.as_bytes()[close] == b'}' => {
                match row.get(&tail[1..close]) {
                    Some(value) => rendered.push_str(&cell_text(value)),
                    None => rendered.push_str(&tail[..=close]),
                }
                rest = &tail[close + 1..];
            }
            // Lone or nested brace: keep it and resume after it.
            _ => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn classification_prompt(rendered: &str, rails: &[String], explain: bool) -> String {
    let labels = rails.join(", ");
    if explain {
        format!(
            "{rendered}\n\n\
             First, write out in a step by step manner an EXPLANATION to show how to reach \
             your answer. Then respond with a single LABEL from this list: {labels}.\n\
             Use the following format:\n\
             EXPLANATION: <your reasoning>\n\
             LABEL: <one of the labels>"
        )
    } else {
        format!("{rendered}\n\nRespond with a single word from this list: {labels}.")
    }
}

/// Split a judge response into a label on the rails and an explanation.
pub fn parse_response(text: &str, rails: &[String], explain: bool) -> (String, Option<String>) {
    if !explain {
        return (snap_to_rails(text, rails), None);
    }

    let lines: Vec<&str> = text.lines().collect();
    let label_line = lines
        .iter()
        .rposition(|line| strip_marker(line, "LABEL:").is_some());
    let Some(label_at) = label_line else {
        return (snap_to_rails(text, rails), Some(text.trim().to_string()));
    };

    let label = strip_marker(lines[label_at], "LABEL:").unwrap_or_default();
    let before = lines[..label_at].join("\n");
    let explanation = match before.to_ascii_uppercase().find("EXPLANATION:") {
        Some(at) => before[at + "EXPLANATION:".len()..].trim().to_string(),
        None => before.trim().to_string(),
    };
    let explanation = (!explanation.is_empty()).then_some(explanation);
    (snap_to_rails(label, rails), explanation)
}

/// Map free text onto exactly one rail, or [`NOT_PARSABLE`].
pub fn snap_to_rails(candidate: &str, rails: &[String]) -> String {
    let cleaned = candidate
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '.' | '*' | '`'))
        .trim();

    if let Some(rail) = rails.iter().find(|rail| rail.as_str() == cleaned) {
        return rail.clone();
    }
    if let Some(rail) = rails.iter().find(|rail| rail.eq_ignore_ascii_case(cleaned)) {
        return rail.clone();
    }

    let lowered = cleaned.to_lowercase();
    let mut mentioned = rails
        .iter()
        .filter(|rail| lowered.contains(&rail.to_lowercase()));
    match (mentioned.next(), mentioned.next()) {
        (Some(rail), None) => rail.clone(),
        _ => NOT_PARSABLE.to_string(),
    }
}

fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let head = trimmed.get(..marker.len())?;
    head.eq_ignore_ascii_case(marker)
        .then(|| trimmed[marker.len()..].trim())
}

/// Runs a [`Judge`] over the context's [`DATAFRAME_KEY`] table.
///
/// The context's template and rails drive the classification; `model` and
/// `provide_explanation` params override the defaults.
pub struct JudgeEvaluator<J> {
    judge: J,
    name: String,
    model: String,
}

impl<J: Judge> JudgeEvaluator<J> {
    pub fn new(judge: J, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            judge,
            name: name.into(),
            model: model.into(),
        }
    }

    pub fn judge(&self) -> &J {
        &self.judge
    }

    fn failure(&self, reason: impl Into<String>) -> Error {
        Error::Evaluator {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl<J: Judge> Evaluator for JudgeEvaluator<J> {
    type Output = Table;

    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, ctx: &EvalContext) -> Result<Table> {
        let rows = ctx
            .get_table(DATAFRAME_KEY)
            .cloned()
            .ok_or_else(|| self.failure(format!("context has no '{DATAFRAME_KEY}' table")))?;
        let model = match ctx.get_param("model") {
            Some(Value::String(model)) => model.clone(),
            Some(other) => return Err(self.failure(format!("model param must be a string, got {other}"))),
            None => self.model.clone(),
        };
        let explain = ctx
            .get_param("provide_explanation")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut request = ClassifyRequest::new(rows, model, ctx.template.clone(), ctx.rails.clone());
        if !explain {
            request = request.without_explanation();
        }
        self.judge.classify(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use sia_models::{ChatResponse, Usage};
    use sia_models::providers::StopReason;
    use tempfile::tempdir;

    use crate::tracker::EvaluatorTracker;

    /// Replies with canned texts in order and keeps the prompts it saw.
    struct ScriptedProvider {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: ChatRequest) -> sia_models::Result<ChatResponse> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages[0].content.clone());
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| sia_models::Error::ProviderApi("out of replies".into()))?;
            Ok(ChatResponse {
                text,
                stop_reason: StopReason::EndTurn,
                usage: Usage::new(10, 5),
            })
        }
    }

    fn rails() -> Vec<String> {
        vec!["1".into(), "2".into(), "3".into()]
    }

    fn pairs() -> Table {
        Table::from_records(&[
            json!({"ORIGINAL_TEXT": "teh cat", "REWRITTEN_TEXT": "The cat."}),
            json!({"ORIGINAL_TEXT": "a dog", "REWRITTEN_TEXT": "A dog."}),
        ])
        .unwrap()
    }

    #[test]
    fn render_template_fills_known_columns_only() {
        let row = pairs().rows()[0].clone();
        let rendered = render_template("Was {ORIGINAL_TEXT} -> {REWRITTEN_TEXT} ok? {OTHER}", &row);
        assert_eq!(rendered, "Was teh cat -> The cat. ok? {OTHER}");
    }

    #[test]
    fn render_template_does_not_expand_placeholders_inside_values() {
        let row = Table::from_records(&[json!({
            "ORIGINAL_TEXT": "see {REWRITTEN_TEXT}",
            "REWRITTEN_TEXT": "OUT"
        })])
        .unwrap()
        .rows()[0]
            .clone();

        let rendered = render_template("A={ORIGINAL_TEXT} B={REWRITTEN_TEXT}", &row);
        assert_eq!(rendered, "A=see {REWRITTEN_TEXT} B=OUT");
    }

    #[test]
    fn render_template_keeps_stray_braces() {
        let row = pairs().rows()[0].clone();
        let rendered = render_template("{ {ORIGINAL_TEXT}} {REWRITTEN_TEXT", &row);
        assert_eq!(rendered, "{ teh cat} {REWRITTEN_TEXT");
    }

    #[test]
    fn snap_to_rails_matches_exact_case_and_mentions() {
        let rails = vec!["relevant".to_string(), "irrelevant".to_string()];
        assert_eq!(snap_to_rails("relevant", &rails), "relevant");
        assert_eq!(snap_to_rails(" IRRELEVANT. ", &rails), "irrelevant");
        assert_eq!(snap_to_rails("\"relevant\"", &rails), "relevant");
        assert_eq!(snap_to_rails("clearly relevant text", &rails[..1]), "relevant");
        assert_eq!(snap_to_rails("no idea", &rails), NOT_PARSABLE);
    }

    #[test]
    fn ambiguous_mentions_are_not_parsable() {
        assert_eq!(snap_to_rails("between 2 and 3", &rails()), NOT_PARSABLE);
    }

    #[test]
    fn parse_response_splits_explanation_and_label() {
        let text = "EXPLANATION: Fixes the typo and adds a period.\nLABEL: 3";
        let (label, explanation) = parse_response(text, &rails(), true);
        assert_eq!(label, "3");
        assert_eq!(explanation.as_deref(), Some("Fixes the typo and adds a period."));
    }

    #[test]
    fn parse_response_without_label_line_falls_back_to_snapping() {
        let (label, explanation) = parse_response("I would say 2", &rails(), true);
        assert_eq!(label, "2");
        assert_eq!(explanation.as_deref(), Some("I would say 2"));
    }

    #[tokio::test]
    async fn llm_judge_labels_every_row() {
        let provider = ScriptedProvider::new(&[
            "EXPLANATION: good\nLABEL: 3",
            "EXPLANATION: meh\nlabel: 1",
        ]);
        let judge = LlmJudge::new(provider);

        let out = judge
            .classify(ClassifyRequest::new(pairs(), "gpt-4o-mini", "Rate {REWRITTEN_TEXT}", rails()))
            .await
            .unwrap();

        let labels: Vec<_> = out.column(LABEL_COLUMN).map(|v| v.cloned()).collect();
        assert_eq!(labels, vec![Some(json!("3")), Some(json!("1"))]);
        assert_eq!(out.rows()[1][EXPLANATION_COLUMN], "meh");

        let prompts = judge.provider().prompts.lock().unwrap().clone();
        assert!(prompts[0].starts_with("Rate The cat."));
        assert!(prompts[0].contains("1, 2, 3"));
    }

    #[tokio::test]
    async fn llm_judge_fails_the_whole_batch() {
        let judge = LlmJudge::new(ScriptedProvider::new(&["LABEL: 2"]));

        let err = judge
            .classify(ClassifyRequest::new(pairs(), "m", "Rate {REWRITTEN_TEXT}", rails()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Judge(ref reason) if reason.starts_with("row 1")));
    }

    #[tokio::test]
    async fn without_explanation_emits_labels_only() {
        let judge = LlmJudge::new(ScriptedProvider::new(&["2", "3"]));

        let out = judge
            .classify(
                ClassifyRequest::new(pairs(), "m", "Rate {REWRITTEN_TEXT}", rails())
                    .without_explanation(),
            )
            .await
            .unwrap();

        assert!(out.rows().iter().all(|row| !row.contains_key(EXPLANATION_COLUMN)));
    }

    #[tokio::test]
    async fn tracked_judge_records_template_rails_and_first_label() {
        let dir = tempdir().unwrap();
        let mut tracker = EvaluatorTracker::open(dir.path()).unwrap();
        let judge = LlmJudge::new(ScriptedProvider::new(&["LABEL: 3", "LABEL: 2"]));
        let evaluator = JudgeEvaluator::new(judge, "formatting_classify", "gpt-4o-mini");

        let ctx = EvalContext::new("Rate {REWRITTEN_TEXT}", rails()).table(DATAFRAME_KEY, pairs());
        let out = tracker.track(evaluator).unwrap().evaluate(&ctx).await.unwrap();
        assert_eq!(out.len(), 2);

        let data = tracker.get("formatting_classify").unwrap().unwrap();
        assert_eq!(data.calls.len(), 1);
        assert_eq!(data.calls[0].rails, rails());
        assert_eq!(data.calls[0].metadata[LABEL_COLUMN], "3");
        assert_eq!(
            data.calls[0].inputs[DATAFRAME_KEY]["dataframe_records"][0]["ORIGINAL_TEXT"],
            "teh cat"
        );
    }

    #[tokio::test]
    async fn judge_evaluator_requires_a_dataframe() {
        let evaluator = JudgeEvaluator::new(LlmJudge::new(ScriptedProvider::new(&[])), "fmt", "m");
        let err = evaluator
            .evaluate(&EvalContext::new("T", rails()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Evaluator { ref name, .. } if name == "fmt"));
    }
}
