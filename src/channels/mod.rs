//! Channels module - surface adapters.
//!
//! A channel receives messages from users, publishes them on the bus and
//! delivers outbound replies addressed to its name.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ChannelManager                │
//! │   ┌─────────┐   ┌─────────┐   ┌─────────┐    │
//! │   │   cli   │   │  ...    │   │  ...    │    │
//! │   └────┬────┘   └────┬────┘   └────┬────┘    │
//! │        └─────────────┼─────────────┘         │
//! │                 ┌────┴────┐                  │
//! │                 │   Bus   │                  │
//! │                 └─────────┘                  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod cli;
pub mod manager;
mod types;

pub use cli::{CliChannel, CLI_CHANNEL, CLI_CHAT_ID};
pub use manager::ChannelManager;
pub use types::Channel;
