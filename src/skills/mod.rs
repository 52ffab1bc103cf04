//! Skills system - markdown skill discovery and loading.

mod loader;
mod types;

pub use loader::SkillsLoader;
pub use types::{Skill, SkillInfo, SkillMetadata, SkillRequirements};
