//! Evaluator tracking, state-action assembly and ephemeral validation for sia.
//!
//! This crate turns production telemetry into training data for prompt
//! optimization and scores candidate prompts against it.
//!
//! # Architecture
//!
//! ```text
//!  Evaluator ──► EvaluatorTracker ──► EvaluatorStore (evaluators/<name>.json)
//!                       │
//!                       ▼
//!  TelemetrySource ──► DataCollectionRunner ──► StateActions
//!                                                   │
//!                 CheckpointStore (latest Actions) ─┤
//!                                                   ▼
//!                   PolicyEnvironment / EphemeralValidator
//!                   (replay via CompletionProvider, score via Judge)
//! ```
//!
//! - **Tracking** ([`EvaluatorTracker`]) records every evaluator invocation
//!   with its template, rails and output, and persists it per evaluator
//! - **Collection** ([`DataCollectionRunner`]) joins a telemetry window with
//!   tracked evaluator constants into a [`StateActions`]
//! - **Validation** ([`EphemeralValidator`]) replays the window under the
//!   latest checkpoint and averages the judge's labels

pub mod collection;
pub mod config;
pub mod environment;
mod error;
pub mod judge;
pub mod policy;
pub mod replay;
pub mod state_action;
pub mod storage;
pub mod table;
pub mod telemetry;
pub mod tracker;
mod types;
pub mod validation;
mod window;

// Error types
pub use error::{Error, ErrorKind, Result};

// ID types
pub use types::{CheckpointId, RunId, StateActionsId};

// Time windows
pub use window::TimeWindow;

// Tracking
pub use tracker::{
    EvalContext, Evaluator, EvaluatorCall, EvaluatorData, EvaluatorTracker, Persistence, Tracked,
};

// Collection and assembly
pub use collection::{DataCollectionRunner, DivergencePolicy};
pub use state_action::{Actions, EvalConstant, EvalMetrics, Sample, StateActions};
pub use table::{Row, Table};
pub use telemetry::{ExportFileSource, TelemetryQuery, TelemetrySource, TelemetryTarget};

// Judging, policy and validation
pub use environment::{EmulatedSample, EmulationReport, PolicyEnvironment};
pub use judge::{ClassifyRequest, Judge, JudgeEvaluator, LlmJudge};
pub use policy::{CheckpointStore, FileCheckpointStore, PolicyUpdater, update_and_checkpoint};
pub use replay::ReplayOutcome;
pub use validation::{EphemeralValidator, ValidationReport, calculate_average_score};

// Configuration
pub use config::{ConfigLoader, SiaConfig};
