//! Context builder for agent conversations
//!
//! `ContextBuilder` assembles the system prompt from runtime info, workspace
//! bootstrap documents, memory and skills, then wraps history and the
//! current input into the message list sent to the provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use crate::memory::MemoryStore;
use crate::session::Message;
use crate::skills::SkillsLoader;

/// Default identity for the PicoClaw agent
const DEFAULT_SYSTEM_PROMPT: &str = r#"You are PicoClaw, a small personal AI assistant.

You have access to tools to help accomplish tasks. Use them when needed.
To remember something long-term, it will be folded into memory/MEMORY.md.
Skills listed below can be loaded by reading their location with read_file.

Be concise but helpful. Focus on completing the user's request efficiently."#;

/// Workspace documents inlined into the system prompt, in order.
pub const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Runtime context injected into the system prompt.
///
/// # Example
///
/// ```rust
/// use picoclaw::agent::RuntimeContext;
///
/// let ctx = RuntimeContext::new()
///     .with_channel("telegram", "42")
///     .with_workspace("/home/user/.picoclaw/workspace")
///     .with_os_info();
///
/// let rendered = ctx.render().unwrap();
/// assert!(rendered.contains("Channel: telegram"));
/// assert!(rendered.contains("Chat: 42"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub available_tools: Vec<String>,
    /// RFC 3339 timestamp
    pub current_time: Option<String>,
    pub workspace: Option<String>,
    /// e.g. "linux x86_64"
    pub os_info: Option<String>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: &str, chat_id: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.chat_id = Some(chat_id.to_string());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.available_tools = tools;
        self
    }

    /// Set the current time to now (local time, RFC 3339).
    pub fn with_current_time(mut self) -> Self {
        self.current_time = Some(chrono::Local::now().to_rfc3339());
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    pub fn with_os_info(mut self) -> Self {
        self.os_info = Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_none()
            && self.chat_id.is_none()
            && self.available_tools.is_empty()
            && self.current_time.is_none()
            && self.workspace.is_none()
            && self.os_info.is_none()
    }

    /// Render as a markdown section, or `None` when nothing is set.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(ref time) = self.current_time {
            parts.push(format!("- Current time: {}", time));
        }
        if let Some(ref os) = self.os_info {
            parts.push(format!("- Platform: {}", os));
        }
        if let Some(ref workspace) = self.workspace {
            parts.push(format!("- Workspace: {}", workspace));
        }
        if let Some(ref channel) = self.channel {
            parts.push(format!("- Channel: {}", channel));
        }
        if let Some(ref chat_id) = self.chat_id {
            parts.push(format!("- Chat: {}", chat_id));
        }
        if !self.available_tools.is_empty() {
            parts.push(format!(
                "- Available tools: {}",
                self.available_tools.join(", ")
            ));
        }

        Some(format!("## Runtime Context\n\n{}", parts.join("\n")))
    }
}

#[derive(Debug, Clone)]
struct CachedFile {
    modified: SystemTime,
    content: String,
}

/// Builder for the provider-facing message list.
///
/// File reads are cached by path and invalidated when the file's
/// modification time changes.
///
/// # Example
///
/// ```rust
/// use picoclaw::agent::ContextBuilder;
/// use picoclaw::session::Message;
///
/// let workspace = tempfile::tempdir().unwrap();
/// let builder = ContextBuilder::new(workspace.path());
///
/// let history = vec![Message::user("Hello"), Message::assistant("Hi there!")];
/// let messages = builder.build_messages(history, "How are you?");
/// assert_eq!(messages.len(), 4); // system + 2 history + new user
/// ```
pub struct ContextBuilder {
    workspace: PathBuf,
    system_prompt: String,
    memory: MemoryStore,
    skills: SkillsLoader,
    memory_days: u32,
    always_load: Vec<String>,
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
}

impl ContextBuilder {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            memory: MemoryStore::new(workspace),
            skills: SkillsLoader::for_workspace(workspace),
            memory_days: 2,
            always_load: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Number of days of daily notes to include (0 disables them).
    pub fn with_memory_days(mut self, days: u32) -> Self {
        self.memory_days = days;
        self
    }

    /// Skills to inline in addition to those marked `always: true`.
    pub fn with_always_skills(mut self, names: Vec<String>) -> Self {
        self.always_load = names;
        self
    }

    pub fn with_skills_loader(mut self, loader: SkillsLoader) -> Self {
        self.skills = loader;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Default runtime info for this workspace (time, OS, workspace path).
    pub fn runtime(&self) -> RuntimeContext {
        RuntimeContext::new()
            .with_current_time()
            .with_os_info()
            .with_workspace(&self.workspace.to_string_lossy())
    }

    /// Assemble the full system prompt.
    pub fn build_system_prompt(&self, runtime: &RuntimeContext) -> String {
        let mut sections = vec![self.system_prompt.clone()];

        if let Some(rendered) = runtime.render() {
            sections.push(rendered);
        }

        for name in BOOTSTRAP_FILES {
            if let Some(content) = self.read_cached(&self.workspace.join(name)) {
                sections.push(format!("## {}\n\n{}", name, content));
            }
        }

        if let Some(memory) = self.memory_section() {
            sections.push(memory);
        }

        let always = self.always_skill_names();
        if !always.is_empty() {
            let inlined = self.skills.load_skills_for_context(&always);
            if !inlined.is_empty() {
                sections.push(format!("# Active Skills\n\n{}", inlined));
            }
        }

        let summary = self.skills.build_skills_summary(&always);
        if !summary.is_empty() {
            sections.push(format!(
                "# Skills\n\nThe following skills extend your capabilities. \
                 To use one, read its SKILL.md file with read_file.\n\n{}",
                summary
            ));
        }

        sections.join(SECTION_SEPARATOR)
    }

    pub fn build_system_message(&self, runtime: &RuntimeContext) -> Message {
        Message::system(&self.build_system_prompt(runtime))
    }

    /// `[system, ...history, user(current)]`; an empty `current` is omitted.
    pub fn build_messages(&self, history: Vec<Message>, current: &str) -> Vec<Message> {
        self.build_messages_with(history, current, &self.runtime())
    }

    pub fn build_messages_with(
        &self,
        history: Vec<Message>,
        current: &str,
        runtime: &RuntimeContext,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(self.build_system_message(runtime));
        messages.extend(history);
        if !current.is_empty() {
            messages.push(Message::user(current));
        }
        messages
    }

    /// Number of files currently held in the read cache.
    pub fn cached_files(&self) -> usize {
        self.lock_cache().len()
    }

    fn memory_section(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(long_term) = self.read_cached(&self.memory.long_term_path()) {
            parts.push(format!("## Long-term Memory\n\n{}", long_term));
        }
        for path in self.memory.recent_daily_paths(self.memory_days) {
            if let Some(note) = self.read_cached(&path) {
                parts.push(note);
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(format!("# Memory\n\n{}", parts.join("\n\n")))
    }

    fn always_skill_names(&self) -> Vec<String> {
        let mut names = self.always_load.clone();
        for name in self.skills.get_always_skills() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Read a file through the mtime-keyed cache. Missing or blank files yield `None`.
    fn read_cached(&self, path: &Path) -> Option<String> {
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                self.lock_cache().remove(path);
                return None;
            }
        };

        if let Some(entry) = self.lock_cache().get(path) {
            if entry.modified == modified {
                return non_blank(&entry.content);
            }
        }

        let content = std::fs::read_to_string(path).ok()?;
        debug!(path = %path.display(), "Context file loaded");
        let result = non_blank(&content);
        self.lock_cache()
            .insert(path.to_path_buf(), CachedFile { modified, content });
        result
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CachedFile>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn non_blank(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_runtime_context_render() {
        assert!(RuntimeContext::new().render().is_none());
        let rendered = RuntimeContext::new()
            .with_channel("cli", "direct")
            .with_tools(vec!["echo".into(), "spawn".into()])
            .render()
            .unwrap();
        assert!(rendered.starts_with("## Runtime Context"));
        assert!(rendered.contains("Chat: direct"));
        assert!(rendered.contains("echo, spawn"));
    }

    #[test]
    fn test_build_messages_shape() {
        let dir = TempDir::new().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let messages = builder.build_messages(vec![Message::assistant("earlier")], "now");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "earlier");
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "now");

        let without_input = builder.build_messages(vec![], "");
        assert_eq!(without_input.len(), 1);
    }

    #[test]
    fn test_sections_in_order() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        std::fs::write(ws.join("AGENTS.md"), "agent rules").unwrap();
        std::fs::write(ws.join("USER.md"), "user is Sam").unwrap();
        std::fs::create_dir_all(ws.join("memory")).unwrap();
        std::fs::write(ws.join("memory/MEMORY.md"), "prefers short answers").unwrap();
        std::fs::create_dir_all(ws.join("skills/notes")).unwrap();
        std::fs::write(
            ws.join("skills/notes/SKILL.md"),
            "---\nname: notes\ndescription: Note taking\n---\nWrite notes.",
        )
        .unwrap();

        let builder = ContextBuilder::new(ws);
        let prompt = builder.build_system_prompt(&RuntimeContext::new().with_channel("cli", "1"));

        let runtime = prompt.find("Runtime Context").unwrap();
        let agents = prompt.find("agent rules").unwrap();
        let user = prompt.find("user is Sam").unwrap();
        let memory = prompt.find("prefers short answers").unwrap();
        let skills = prompt.find("<skills>").unwrap();
        assert!(runtime < agents && agents < user && user < memory && memory < skills);
        // Missing bootstrap files are omitted.
        assert!(!prompt.contains("## SOUL.md"));
    }

    #[test]
    fn test_always_skills_inlined_not_summarized() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        std::fs::create_dir_all(ws.join("skills/style")).unwrap();
        std::fs::write(
            ws.join("skills/style/SKILL.md"),
            "---\nname: style\ndescription: House style\n---\nUse plain words.",
        )
        .unwrap();

        let builder = ContextBuilder::new(ws).with_always_skills(vec!["style".into()]);
        let prompt = builder.build_system_prompt(&RuntimeContext::new());
        assert!(prompt.contains("Use plain words."));
        assert!(!prompt.contains("<name>style</name>"));
    }

    #[test]
    fn test_file_cache_invalidated_by_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("SOUL.md");
        std::fs::write(&path, "first soul").unwrap();

        let builder = ContextBuilder::new(dir.path());
        assert!(builder.build_system_prompt(&RuntimeContext::new()).contains("first soul"));
        assert_eq!(builder.cached_files(), 1);

        std::fs::write(&path, "second soul").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let prompt = builder.build_system_prompt(&RuntimeContext::new());
        assert!(prompt.contains("second soul"));
        assert!(!prompt.contains("first soul"));

        std::fs::remove_file(&path).unwrap();
        assert!(!builder.build_system_prompt(&RuntimeContext::new()).contains("soul"));
        assert_eq!(builder.cached_files(), 0);
    }
}
