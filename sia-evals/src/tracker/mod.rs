//! Evaluator invocation tracking.
//!
//! [`EvaluatorTracker`] owns the in-memory histories of every evaluator it
//! has seen and mirrors them to an [`EvaluatorStore`]. Wrapping an evaluator
//! with [`EvaluatorTracker::track`] yields a [`Tracked`] proxy with the same
//! `evaluate` calling convention that records each successful invocation.
//!
//! # Durability
//!
//! A call is durable once `evaluate` returns `Ok`:
//! - [`Persistence::Deferred`] (default) appends the call to a journal and
//!   leaves the document rewrite to [`EvaluatorTracker::flush`]
//! - [`Persistence::EveryCall`] rewrites the evaluator's document per call
//!
//! Writers need `&mut EvaluatorTracker`, so two tracked evaluators cannot
//! record into the same tracker concurrently.

mod call;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

pub use call::{EvalContext, Evaluator, EvaluatorCall, EvaluatorData, TABLE_RECORDS_KEY};

use crate::storage::{EvaluatorStore, FileEvaluatorStore, validate_name};
use crate::Result;

/// When tracked calls are written to the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    /// Rewrite the evaluator's document after every call.
    EveryCall,
    /// Journal each call; rewrite documents on [`EvaluatorTracker::flush`].
    #[default]
    Deferred,
}

/// Records evaluator invocations and serves their histories.
pub struct EvaluatorTracker {
    store: Box<dyn EvaluatorStore>,
    tracked: HashMap<String, EvaluatorData>,
    dirty: BTreeSet<String>,
    persistence: Persistence,
}

impl EvaluatorTracker {
    /// Create a tracker over any store.
    pub fn new(store: impl EvaluatorStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            tracked: HashMap::new(),
            dirty: BTreeSet::new(),
            persistence: Persistence::default(),
        }
    }

    /// Create a tracker persisting to JSON files under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(FileEvaluatorStore::open(dir)?))
    }

    /// Create a tracker in the default state directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(FileEvaluatorStore::open_default()?))
    }

    /// Choose when documents are rewritten.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Wrap an evaluator, recording under [`Evaluator::name`].
    pub fn track<E: Evaluator>(&mut self, evaluator: E) -> Result<Tracked<'_, E>> {
        let name = evaluator.name().to_string();
        self.track_as(evaluator, name)
    }

    /// Wrap an evaluator, recording under an explicit name.
    pub fn track_as<E: Evaluator>(
        &mut self,
        evaluator: E,
        name: impl Into<String>,
    ) -> Result<Tracked<'_, E>> {
        let name = name.into();
        validate_name(&name)?;
        debug!(evaluator = %name, "tracking evaluator");
        Ok(Tracked {
            tracker: self,
            evaluator,
            name,
        })
    }

    /// Append a call to `name`'s history and persist it.
    ///
    /// Existing history is loaded first so sequence numbers continue across
    /// restarts. If persisting fails the call is not kept in memory either.
    pub fn record(&mut self, name: &str, call: EvaluatorCall) -> Result<()> {
        validate_name(name)?;
        call.validate()?;
        self.ensure_resident(name)?;

        let data = self
            .tracked
            .entry(name.to_string())
            .or_insert_with(|| EvaluatorData::new(name));
        data.calls.push(call);
        let seq = data.calls.len() - 1;

        let persisted = match self.persistence {
            Persistence::EveryCall => self.store.save(data),
            Persistence::Deferred => self.store.append(name, seq, &data.calls[seq]),
        };
        if let Err(e) = persisted {
            data.calls.pop();
            return Err(e);
        }

        match self.persistence {
            Persistence::EveryCall => {
                self.dirty.remove(name);
            }
            Persistence::Deferred => {
                self.dirty.insert(name.to_string());
            }
        }
        info!(evaluator = name, calls = seq + 1, "recorded evaluator call");
        Ok(())
    }

    /// Get an evaluator's history.
    ///
    /// Served from memory when resident, otherwise loaded from the store and
    /// cached. `Ok(None)` means nothing was ever recorded under `name`.
    pub fn get(&mut self, name: &str) -> Result<Option<&EvaluatorData>> {
        validate_name(name)?;
        self.ensure_resident(name)?;
        Ok(self.tracked.get(name))
    }

    /// Persist one evaluator's full history.
    ///
    /// Unknown names are a no-op.
    pub fn save(&mut self, name: &str) -> Result<()> {
        if let Some(data) = self.tracked.get(name) {
            self.store.save(data)?;
            self.dirty.remove(name);
        }
        Ok(())
    }

    /// Persist every resident history.
    pub fn save_all(&mut self) -> Result<()> {
        let mut names: Vec<String> = self.tracked.keys().cloned().collect();
        names.sort();
        for name in names {
            self.save(&name)?;
        }
        Ok(())
    }

    /// Rewrite the documents of histories with journaled calls.
    pub fn flush(&mut self) -> Result<()> {
        let pending: Vec<String> = self.dirty.iter().cloned().collect();
        for name in pending {
            self.save(&name)?;
        }
        Ok(())
    }

    /// Whether `name` has calls not yet folded into its document.
    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    /// Names of histories currently held in memory, sorted.
    pub fn resident(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tracked.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn ensure_resident(&mut self, name: &str) -> Result<()> {
        if self.tracked.contains_key(name) {
            return Ok(());
        }
        if let Some(data) = self.store.load(name)? {
            debug!(evaluator = name, calls = data.calls.len(), "cached evaluator history");
            self.tracked.insert(name.to_string(), data);
        }
        Ok(())
    }
}

/// An evaluator whose invocations are recorded by a tracker.
pub struct Tracked<'t, E> {
    tracker: &'t mut EvaluatorTracker,
    evaluator: E,
    name: String,
}

impl<E: Evaluator> Tracked<'_, E> {
    /// Name the calls are recorded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped evaluator.
    pub fn inner(&self) -> &E {
        &self.evaluator
    }

    /// Run the evaluator and record the call.
    ///
    /// Calls without a template or rails fail before the evaluator runs and
    /// leave no history entry. The evaluator's output is returned unmodified.
    pub async fn evaluate(&mut self, ctx: &EvalContext) -> Result<E::Output> {
        let timestamp = Utc::now();
        ctx.validate()?;

        let output = self.evaluator.evaluate(ctx).await?;

        let recorded = serde_json::to_value(&output).unwrap_or_else(|_| {
            json!({ "type": call::short_type_name(std::any::type_name::<E::Output>()) })
        });
        let call = EvaluatorCall::new(timestamp, ctx, recorded);
        self.tracker.record(&self.name, call)?;

        Ok(output)
    }
}
