//! Skills type definitions.

use serde::{Deserialize, Serialize};

/// Loaded skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Absolute path to `SKILL.md`.
    pub path: String,
    /// Source type: `workspace` or `builtin`.
    pub source: String,
    pub metadata: SkillMetadata,
    /// Markdown body without frontmatter.
    pub content: String,
}

/// Skill listing entry.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub path: String,
    pub source: String,
}

/// Parsed YAML frontmatter of a `SKILL.md`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    /// Inline the full skill in every system prompt.
    pub always: bool,
    pub requires: SkillRequirements,
}

/// Runtime requirements gating a skill's availability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillRequirements {
    /// Binaries that must all be on `PATH`.
    pub bins: Vec<String>,
    /// Environment variables that must all be set.
    pub env: Vec<String>,
}
