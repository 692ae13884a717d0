//! Evaluator invocation records and the typed call context.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::state_action::EvalConstant;
use crate::table::Table;
use crate::Result;

/// Key under which table arguments are projected in a call snapshot.
pub const TABLE_RECORDS_KEY: &str = "dataframe_records";

/// Arguments of one evaluator invocation.
///
/// `template` and `rails` are first-class; everything else the evaluator
/// needs travels in `params` (scalars) or `tables` (tabular inputs).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    pub template: String,
    pub rails: Vec<String>,
    pub params: Map<String, Value>,
    pub tables: BTreeMap<String, Table>,
}

impl EvalContext {
    pub fn new<R, S>(template: impl Into<String>, rails: R) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            template: template.into(),
            rails: rails.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Attach a named argument.
    ///
    /// Values that cannot be represented as JSON are recorded as a
    /// `{"type": "<TypeName>"}` marker instead of failing the call.
    pub fn param<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|_| json!({ "type": short_type_name(std::any::type_name::<T>()) }));
        self.params.insert(key.into(), value);
        self
    }

    /// Attach a tabular argument.
    pub fn table(mut self, key: impl Into<String>, table: Table) -> Self {
        self.tables.insert(key.into(), table);
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_table(&self, key: &str) -> Option<&Table> {
        self.tables.get(key)
    }

    /// Reject calls without a template or rails.
    pub fn validate(&self) -> Result<()> {
        validate_template_and_rails(&self.template, &self.rails)
            .map_err(crate::Error::InvalidCall)
    }

    /// Serializable projection of the arguments, as recorded in history.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut inputs = Map::new();
        inputs.insert("template".to_string(), Value::String(self.template.clone()));
        inputs.insert("rails".to_string(), json!(self.rails));
        for (key, value) in &self.params {
            inputs.insert(key.clone(), value.clone());
        }
        for (key, table) in &self.tables {
            inputs.insert(key.clone(), json!({ TABLE_RECORDS_KEY: table }));
        }
        inputs
    }
}

/// A function that judges inputs against a template and rails.
///
/// Wrap one with [`EvaluatorTracker::track`](super::EvaluatorTracker::track)
/// to record every invocation.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Whatever the evaluator returns; recorded verbatim as JSON.
    type Output: Serialize + Send;

    /// Logical identity used as the history key.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    async fn evaluate(&self, ctx: &EvalContext) -> Result<Self::Output>;
}

/// One recorded invocation of an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorCall {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub template: String,
    pub rails: Vec<String>,
}

impl EvaluatorCall {
    /// Record an invocation that produced `output`.
    ///
    /// Tabular outputs contribute their first row as `metadata`.
    pub fn new(timestamp: DateTime<Utc>, ctx: &EvalContext, output: Value) -> Self {
        let metadata = Table::first_record(&output).unwrap_or_default();
        Self {
            timestamp,
            inputs: ctx.snapshot(),
            output,
            metadata,
            template: ctx.template.clone(),
            rails: ctx.rails.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_template_and_rails(&self.template, &self.rails)
            .map_err(crate::Error::InvalidCall)
    }

    /// Whether two calls used the same template and rails.
    pub fn same_constants(&self, other: &EvaluatorCall) -> bool {
        self.template == other.template && self.rails == other.rails
    }
}

/// Full ordered history of one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorData {
    pub name: String,
    #[serde(default)]
    pub calls: Vec<EvaluatorCall>,
}

impl EvaluatorData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Vec::new(),
        }
    }

    pub fn first_call(&self) -> Option<&EvaluatorCall> {
        self.calls.first()
    }

    /// Template and rails of the first recorded call.
    pub fn constant(&self) -> Option<EvalConstant> {
        self.first_call().map(|call| EvalConstant {
            name: self.name.clone(),
            eval_template: call.template.clone(),
            eval_rails: call.rails.clone(),
        })
    }

    /// Number of calls whose template or rails differ from the first call.
    pub fn divergent_calls(&self) -> usize {
        match self.calls.split_first() {
            Some((first, rest)) => rest.iter().filter(|c| !c.same_constants(first)).count(),
            None => 0,
        }
    }
}

fn validate_template_and_rails(template: &str, rails: &[String]) -> std::result::Result<(), String> {
    if template.trim().is_empty() {
        return Err("template is required".to_string());
    }
    if rails.is_empty() {
        return Err("rails are required".to_string());
    }
    if rails.iter().any(|rail| rail.is_empty()) {
        return Err("rails must not contain empty labels".to_string());
    }
    Ok(())
}

/// `a::b::Foo<c::Bar>` -> `Foo`.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
