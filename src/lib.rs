//! PicoClaw - Ultra-lightweight personal AI assistant framework

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod providers;
pub mod session;
pub mod skills;
pub mod tools;
pub mod utils;

pub use agent::{AgentLoop, SubagentManager};
pub use bus::{Bus, InboundMessage, MessageBus, NetworkBusClient, NetworkBusServer, OutboundMessage};
pub use config::Config;
pub use error::{PicoError, ProviderError, Result};
pub use providers::{
    ChatOptions, LLMProvider, LLMResponse, LLMToolCall, OpenAIProvider, ToolDefinition, Usage,
};
pub use session::{Message, Role, Session, SessionManager, ToolCall};
