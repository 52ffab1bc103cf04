//! Heartbeat - periodic wake-ups driven by `HEARTBEAT.md`.

mod service;

pub use service::{
    is_actionable, HeartbeatResult, HeartbeatService, HeartbeatTarget, HEARTBEAT_CHANNEL,
    HEARTBEAT_FILE, HEARTBEAT_PROMPT,
};
