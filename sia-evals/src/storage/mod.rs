//! Persistence for evaluator histories.
//!
//! Each evaluator's history is mirrored 1:1 to its own store entry:
//! - [`EvaluatorStore::save`] writes the complete, human-diffable document
//! - [`EvaluatorStore::append`] durably records a single call without
//!   rewriting the document
//! - [`EvaluatorStore::load`] reassembles the history from both
//!
//! The file implementation keeps everything under one directory.

mod file;

pub use file::FileEvaluatorStore;

use crate::tracker::{EvaluatorCall, EvaluatorData};
use crate::{Error, Result};

/// Durable storage of evaluator histories.
///
/// Implementations assume a single writer per evaluator name; concurrent
/// writers to the same name race with last-writer-wins semantics.
pub trait EvaluatorStore: Send {
    /// Load one evaluator's history.
    ///
    /// Returns `Ok(None)` only when nothing was ever stored under `name`.
    /// A stored history that fails to parse or validate is an
    /// [`Error::Schema`], never an empty result.
    fn load(&self, name: &str) -> Result<Option<EvaluatorData>>;

    /// Durably record call number `seq` (0-based) of `name`.
    fn append(&self, name: &str, seq: usize, call: &EvaluatorCall) -> Result<()>;

    /// Replace the stored document with `data`.
    fn save(&self, data: &EvaluatorData) -> Result<()>;
}

/// Evaluator names double as file names.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "evaluator name '{name}' must be non-empty and contain only [A-Za-z0-9_.-]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_accepts_file_safe_names() {
        assert!(validate_name("formatting_classify").is_ok());
        assert!(validate_name("tone-v2.1").is_ok());
    }

    #[test]
    fn validate_name_rejects_paths_and_empty() {
        for bad in ["", "..", "a/b", "with space", "ünï"] {
            assert!(
                matches!(validate_name(bad), Err(Error::Configuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
