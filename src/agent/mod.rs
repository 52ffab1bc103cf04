//! Agent module - Core AI agent logic and conversation handling
//!
//! The agent is responsible for:
//!
//! - Processing inbound messages from channels
//! - Building conversation context with system prompts, memory and skills
//! - Calling LLM providers and executing requested tools
//! - Keeping history bounded through compaction and memory consolidation
//! - Running background subagents
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │     Bus     │────>│  AgentLoop  │────>│ LLMProvider │
//! │  (inbound)  │     │             │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Subagent   │<────│    Tools    │     │   Session   │
//! │   Manager   │     │  Registry   │     │   Manager   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use picoclaw::agent::AgentLoop;
//! use picoclaw::bus::MessageBus;
//! use picoclaw::config::Config;
//! use picoclaw::providers::OpenAIProvider;
//! use picoclaw::session::SessionManager;
//!
//! async fn run_agent() {
//!     let provider = Arc::new(OpenAIProvider::new("your-api-key"));
//!     let bus = Arc::new(MessageBus::new());
//!     let agent = Arc::new(AgentLoop::new(
//!         Config::default(),
//!         provider,
//!         SessionManager::new_memory(),
//!         bus,
//!     ));
//!
//!     agent.clone().start().await.unwrap();
//! }
//! ```

pub mod compaction;
pub mod consolidation;
mod context;
mod r#loop;
pub mod subagent;

pub use consolidation::MemoryConsolidator;
pub use context::{ContextBuilder, RuntimeContext, BOOTSTRAP_FILES};
pub use r#loop::{
    AgentLoop, HELP_REPLY, ITERATION_LIMIT_REPLY, NEW_SESSION_REPLY, PROVIDER_ERROR_REPLY,
};
pub use subagent::{
    AgentSubagentRunner, SubagentManager, SubagentRunner, SubagentState, SubagentTask,
};
