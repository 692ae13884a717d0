//! Completion providers and credentials for sia.
//!
//! This crate provides:
//! - [`providers::CompletionProvider`], the seam every model call goes through
//! - Chat message and usage types shared with telemetry and validation
//! - Credential lookup for provider and telemetry API keys
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            CompletionProvider               │
//! │  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │  OpenAiProvider  │  │  (test stubs)   │  │
//! │  └──────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │              CredentialStore                │
//! │       (System Keyring + Env Fallback)       │
//! └─────────────────────────────────────────────┘
//! ```

mod error;

pub mod auth;
pub mod providers;

pub use error::{Error, Result};
pub use providers::{ChatRequest, ChatResponse, CompletionProvider, Message, Role, Usage};
