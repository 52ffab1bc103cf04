//! Providers module - LLM providers
//!
//! This module defines the `LLMProvider` trait and common types for talking
//! to chat-completion backends. The agent loop only sees the trait, so tests
//! and alternative backends plug in without touching the loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use picoclaw::providers::{ChatOptions, LLMProvider, OpenAIProvider};
//! use picoclaw::session::Message;
//!
//! async fn example() {
//!     let provider = OpenAIProvider::new("your-api-key");
//!     let messages = vec![Message::user("Hello!")];
//!     let options = ChatOptions::new().with_max_tokens(1000);
//!
//!     let response = provider.chat(messages, vec![], None, options).await.unwrap();
//!     println!("Response: {}", response.content);
//! }
//! ```

pub mod openai;
mod types;

pub use openai::OpenAIProvider;
pub use types::{
    chat_with_timeout, ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage,
};
