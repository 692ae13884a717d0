//! Replaying recorded conversations under a candidate policy.

use serde::{Deserialize, Serialize};
use sia_models::{ChatRequest, CompletionProvider, Message, Usage};
use tracing::{debug, warn};

use crate::state_action::Actions;

/// Result of regenerating one conversation.
///
/// Failures are values: one failed completion never aborts a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Generated { text: String, usage: Usage },
    Failed { error: String },
}

impl ReplayOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Generated { text, .. } => Some(text),
            Self::Failed { .. } => None,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            Self::Generated { usage, .. } => Some(*usage),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Generated { .. } => None,
        }
    }
}

/// Messages sent for one replay: the candidate system prompt, then the
/// history with any system turns it carried removed.
pub fn replay_messages(actions: &Actions, history: &[Message]) -> Vec<Message> {
    std::iter::once(Message::system(actions.system_prompt.clone()))
        .chain(history.iter().filter(|m| !m.is_system()).cloned())
        .collect()
}

/// Regenerate every history with `actions`, one completion at a time.
///
/// Returns one outcome per history, in order.
pub async fn replay_samples<P>(
    provider: &P,
    actions: &Actions,
    histories: &[Vec<Message>],
) -> Vec<ReplayOutcome>
where
    P: CompletionProvider + ?Sized,
{
    let mut outcomes = Vec::with_capacity(histories.len());
    for (index, history) in histories.iter().enumerate() {
        let request = ChatRequest::new(actions.model.clone(), replay_messages(actions, history));
        let outcome = match provider.complete(request).await {
            Ok(response) => {
                debug!(sample = index, tokens = response.usage.total_tokens, "replayed sample");
                ReplayOutcome::Generated {
                    text: response.text,
                    usage: response.usage,
                }
            }
            Err(e) => {
                warn!(sample = index, model = %actions.model, error = %e, "replay call failed");
                ReplayOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
