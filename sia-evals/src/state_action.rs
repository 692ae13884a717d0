//! State-action pairs handed to policy updaters and validators.
//!
//! A [`StateActions`] binds a window of telemetry samples to the policy
//! ([`Actions`]) and evaluator constants that were in effect when the samples
//! were produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sia_models::Message;

use crate::types::StateActionsId;

/// One evaluator's judgment of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Evaluator name.
    pub name: String,
    /// Label assigned by the evaluator, `None` when the record carried none.
    pub eval_score: Option<Value>,
    /// Explanation for the label, `None` when the record carried none.
    pub eval_reasoning: Option<String>,
}

/// One recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Conversation leading to the output, without the system turn.
    pub chat_history: Vec<Message>,
    /// Text the model produced for this turn.
    pub output_generation: String,
    /// One entry per requested evaluator, in request order.
    pub evals: Vec<EvalMetrics>,
}

impl Sample {
    /// Content of the first user turn, the text a rewrite task operates on.
    pub fn first_user_turn(&self) -> Option<&str> {
        self.chat_history
            .iter()
            .find(|m| m.role == sia_models::Role::User)
            .map(|m| m.content.as_str())
    }

    /// Chat history with every system turn removed.
    pub fn systemless_history(&self) -> Vec<Message> {
        self.chat_history
            .iter()
            .filter(|m| !m.is_system())
            .cloned()
            .collect()
    }
}

/// The policy under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actions {
    pub system_prompt: String,
    pub model: String,
}

impl Actions {
    pub fn new(system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            model: model.into(),
        }
    }
}

/// Template and rails an evaluator used within a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalConstant {
    pub name: String,
    pub eval_template: String,
    pub eval_rails: Vec<String>,
}

/// Telemetry samples bound to the policy and evaluator constants that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateActions {
    /// Time-ordered identifier.
    pub id: StateActionsId,
    /// When the pair was assembled.
    pub timestamp: DateTime<Utc>,
    /// One sample per telemetry record.
    pub samples: Vec<Sample>,
    /// Window-wide policy.
    pub actions: Actions,
    /// One constant per requested evaluator, in request order.
    pub eval_constants: Vec<EvalConstant>,
}

impl StateActions {
    /// Assemble a new pair stamped with the current time.
    pub fn new(samples: Vec<Sample>, actions: Actions, eval_constants: Vec<EvalConstant>) -> Self {
        Self {
            id: StateActionsId::new(),
            timestamp: Utc::now(),
            samples,
            actions,
            eval_constants,
        }
    }

    /// Look up the constant for one evaluator.
    pub fn eval_constant(&self, name: &str) -> Option<&EvalConstant> {
        self.eval_constants.iter().find(|c| c.name == name)
    }
}
