//! Completion provider trait and implementations.
//!
//! The [`CompletionProvider`] trait is the single seam through which sia
//! talks to a language model: a model name and a list of messages go in,
//! generated text and token usage come out.
//!
//! # Example
//!
//! ```ignore
//! use sia_models::providers::{CompletionProvider, ChatRequest, Message};
//!
//! async fn rewrite(provider: &dyn CompletionProvider) {
//!     let request = ChatRequest::new(
//!         "gpt-4o-mini",
//!         vec![Message::system("Be concise"), Message::user("Hello!")],
//!     );
//!
//!     let response = provider.complete(request).await?;
//!     println!("Response: {}", response.text);
//! }
//! ```

mod openai;
mod types;

use async_trait::async_trait;

pub use openai::OpenAiProvider;
pub use types::*;

use crate::Result;

/// Trait for chat completion providers.
///
/// Implementations perform exactly one network request per call and never
/// retry; retry and backoff belong to the caller or the remote SDK.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Returns the provider name (e.g., "openai").
    fn name(&self) -> &str;

    /// Perform a chat completion request.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A mock provider for testing the trait.
    struct EchoProvider;

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse {
                text: format!("Echo: {last}"),
                stop_reason: StopReason::EndTurn,
                usage: Usage::new(10, 5),
            })
        }
    }

    #[tokio::test]
    async fn provider_complete_returns_response() {
        let provider = EchoProvider;
        let request = ChatRequest::new("test-model", vec![Message::user("Hello")]);
        let response = provider.complete(request).await.unwrap();

        assert_eq!(provider.name(), "echo");
        assert_eq!(response.text, "Echo: Hello");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn provider_is_object_safe() {
        let provider: Box<dyn CompletionProvider> = Box::new(EchoProvider);
        let request = ChatRequest::new("m", vec![Message::user("x")]);
        assert_eq!(provider.complete(request).await.unwrap().text, "Echo: x");
    }
}
