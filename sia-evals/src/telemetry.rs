//! Telemetry windows and the record view used to join them.
//!
//! Records follow the OpenInference flattened-span column convention used by
//! trace exports: dotted attribute paths as column names, chat turns as lists
//! of `{message.role, message.content}` objects.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sia_models::{Message, Role};
use tracing::debug;

use crate::state_action::EvalMetrics;
use crate::table::{Row, Table, kind_of};
use crate::window::TimeWindow;
use crate::{Error, Result};

/// Input chat turns as a list of `{message.role, message.content}`.
pub const INPUT_MESSAGES: &str = "attributes.llm.input_messages";
/// Raw request body; a JSON string with a `messages` array.
pub const INPUT_VALUE: &str = "attributes.input.value";
/// Output turns, same shape as [`INPUT_MESSAGES`].
pub const OUTPUT_MESSAGES: &str = "attributes.llm.output_messages";
/// Model identifier the span was produced with.
pub const MODEL_NAME: &str = "attributes.llm.model_name";
/// Span start, RFC 3339 or epoch milliseconds.
pub const START_TIME: &str = "start_time";

const MESSAGE_ROLE: &str = "message.role";
const MESSAGE_CONTENT: &str = "message.content";

/// Column holding an evaluator's label for a record.
pub fn eval_label_column(evaluator: &str) -> String {
    format!("eval.{evaluator}.label")
}

/// Column holding an evaluator's explanation for a record.
pub fn eval_explanation_column(evaluator: &str) -> String {
    format!("eval.{evaluator}.explanation")
}

/// Which telemetry project to read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryTarget {
    pub model_id: String,
    pub space_id: String,
}

impl TelemetryTarget {
    pub fn new(model_id: impl Into<String>, space_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            space_id: space_id.into(),
        }
    }
}

/// A bounded request for telemetry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryQuery {
    pub model_id: String,
    pub space_id: String,
    pub window: TimeWindow,
    /// Maximum number of records to return.
    pub limit: usize,
}

impl TelemetryQuery {
    pub fn new(target: &TelemetryTarget, window: TimeWindow, limit: usize) -> Self {
        Self {
            model_id: target.model_id.clone(),
            space_id: target.space_id.clone(),
            window,
            limit,
        }
    }
}

/// Source of recorded interaction traces.
///
/// A fetch either returns the whole window or fails; partial windows are
/// never returned.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch at most `query.limit` records inside `query.window`.
    async fn fetch(&self, query: &TelemetryQuery) -> Result<Table>;
}

/// Read-only view over one telemetry row.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryRecord<'a> {
    index: usize,
    row: &'a Row,
}

impl<'a> TelemetryRecord<'a> {
    pub fn new(index: usize, row: &'a Row) -> Self {
        Self { index, row }
    }

    /// Position of the record in its window.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.row.get(column).filter(|v| !v.is_null())
    }

    /// Input turns from the instrumented LLM span.
    pub fn input_messages(&self) -> Result<Vec<Message>> {
        let value = self
            .get(INPUT_MESSAGES)
            .ok_or_else(|| self.missing(INPUT_MESSAGES))?;
        self.flattened_messages(INPUT_MESSAGES, value)
    }

    /// The full conversation sent to the model.
    ///
    /// Prefers the raw request body, falling back to the span's input turns
    /// when the body is absent or is not a chat request.
    pub fn chat_history(&self) -> Result<Vec<Message>> {
        if let Some(messages) = self.request_messages()? {
            return Ok(messages);
        }
        self.input_messages()
    }

    /// Content of the leading system turn.
    pub fn system_prompt(&self) -> Result<String> {
        let messages = match self.get(INPUT_MESSAGES) {
            Some(value) => self.flattened_messages(INPUT_MESSAGES, value)?,
            None => self.chat_history()?,
        };
        match messages.into_iter().next() {
            Some(first) if first.is_system() => Ok(first.content),
            Some(first) => Err(Error::shape(
                self.index,
                format!("first chat turn has role '{}', expected 'system'", first.role),
            )),
            None => Err(Error::shape(self.index, "chat history is empty")),
        }
    }

    pub fn model_name(&self) -> Result<String> {
        match self.get(MODEL_NAME) {
            Some(Value::String(model)) if !model.is_empty() => Ok(model.clone()),
            Some(other) => Err(Error::shape(
                self.index,
                format!("{MODEL_NAME} is {}, expected a model name", kind_of(other)),
            )),
            None => Err(self.missing(MODEL_NAME)),
        }
    }

    /// Text of the first output turn.
    pub fn output_generation(&self) -> Result<String> {
        let value = self
            .get(OUTPUT_MESSAGES)
            .ok_or_else(|| self.missing(OUTPUT_MESSAGES))?;
        self.flattened_messages(OUTPUT_MESSAGES, value)?
            .into_iter()
            .next()
            .map(|m| m.content)
            .ok_or_else(|| Error::shape(self.index, format!("{OUTPUT_MESSAGES} is empty")))
    }

    /// Label and explanation `evaluator` attached to this record.
    ///
    /// Absent fields yield `None`; a record is never rejected for them.
    pub fn eval_metrics(&self, evaluator: &str) -> EvalMetrics {
        let eval_score = self.get(&eval_label_column(evaluator)).cloned();
        let eval_reasoning = self
            .get(&eval_explanation_column(evaluator))
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            });
        EvalMetrics {
            name: evaluator.to_string(),
            eval_score,
            eval_reasoning,
        }
    }

    /// Span start time, if the record carries a readable one.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self.get(START_TIME)? {
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Value::Number(millis) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        }
    }

    fn request_messages(&self) -> Result<Option<Vec<Message>>> {
        let Some(Value::String(body)) = self.get(INPUT_VALUE) else {
            return Ok(None);
        };
        let Ok(Value::Object(request)) = serde_json::from_str::<Value>(body) else {
            return Ok(None);
        };
        let Some(Value::Array(items)) = request.get("messages") else {
            return Ok(None);
        };
        items
            .iter()
            .map(|item| self.parse_message(INPUT_VALUE, item, "role", "content"))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn flattened_messages(&self, column: &str, value: &Value) -> Result<Vec<Message>> {
        let Value::Array(items) = value else {
            return Err(Error::shape(
                self.index,
                format!("{column} is {}, expected a list of messages", kind_of(value)),
            ));
        };
        items
            .iter()
            .map(|item| self.parse_message(column, item, MESSAGE_ROLE, MESSAGE_CONTENT))
            .collect()
    }

    fn parse_message(
        &self,
        column: &str,
        item: &Value,
        role_key: &str,
        content_key: &str,
    ) -> Result<Message> {
        let role = item
            .get(role_key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::shape(self.index, format!("{column}: message without a role")))?;
        let role = Role::parse(role).ok_or_else(|| {
            Error::shape(self.index, format!("{column}: unknown message role '{role}'"))
        })?;
        // Tool-call turns carry no text.
        let content = item
            .get(content_key)
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(Message::new(role, content))
    }

    fn missing(&self, column: &str) -> Error {
        Error::shape(self.index, format!("missing column {column}"))
    }
}

/// Telemetry read from a JSON export of records.
///
/// The file holds one window exported ahead of time as an array of records.
/// Rows are filtered to the query window by [`START_TIME`] (rows without one
/// are kept) and truncated to the query limit.
#[derive(Debug, Clone)]
pub struct ExportFileSource {
    path: PathBuf,
}

impl ExportFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySource for ExportFileSource {
    async fn fetch(&self, query: &TelemetryQuery) -> Result<Table> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        let table: Table =
            serde_json::from_str(&content).map_err(|e| Error::schema(&self.path, e))?;
        let exported = table.len();

        let mut window: Table = table
            .into_rows()
            .into_iter()
            .enumerate()
            .filter(|(index, row)| {
                TelemetryRecord::new(*index, row)
                    .start_time()
                    .is_none_or(|t| query.window.contains(t))
            })
            .map(|(_, row)| row)
            .collect();
        window.truncate(query.limit);

        debug!(
            path = %self.path.display(),
            model_id = %query.model_id,
            exported,
            returned = window.len(),
            "read telemetry export"
        );
        Ok(window)
    }
}
