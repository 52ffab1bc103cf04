//! Skills loader and parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{Skill, SkillInfo, SkillMetadata};

const BUILTIN_SKILLS_DIR: &str = "skills";

static FRONTMATTER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)^---\r?\n(.*?)\r?\n---\r?\n?").ok());

/// Discover and load markdown skills from workspace and builtin directories.
pub struct SkillsLoader {
    workspace_dir: PathBuf,
    builtin_dir: PathBuf,
}

impl SkillsLoader {
    /// Create loader with explicit directories.
    pub fn new(workspace_dir: PathBuf, builtin_dir: Option<PathBuf>) -> Self {
        let builtin = builtin_dir.unwrap_or_else(default_builtin_skills_dir);
        Self {
            workspace_dir,
            builtin_dir: builtin,
        }
    }

    /// Loader for `<workspace>/skills`.
    pub fn for_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join("skills"), None)
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// List known skills (`workspace` overrides `builtin` by name).
    pub fn list_skills(&self) -> Vec<SkillInfo> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        collect_skill_infos(&self.workspace_dir, "workspace", &mut out, &mut seen);
        collect_skill_infos(&self.builtin_dir, "builtin", &mut out, &mut seen);

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Load one skill by name.
    pub fn load_skill(&self, name: &str) -> Option<Skill> {
        let workspace = self.workspace_dir.join(name).join("SKILL.md");
        if workspace.is_file() {
            return parse_skill_file(&workspace, name, "workspace");
        }

        let builtin = self.builtin_dir.join(name).join("SKILL.md");
        if builtin.is_file() {
            return parse_skill_file(&builtin, name, "builtin");
        }

        None
    }

    /// XML summary of every skill not in `exclude`, for the system prompt.
    ///
    /// The model loads a skill's full text on demand with `read_file`.
    pub fn build_skills_summary(&self, exclude: &[String]) -> String {
        let skills: Vec<Skill> = self
            .list_skills()
            .into_iter()
            .filter(|info| !exclude.contains(&info.name))
            .filter_map(|info| self.load_skill(&info.name))
            .collect();
        if skills.is_empty() {
            return String::new();
        }

        let mut lines = vec!["<skills>".to_string()];
        for skill in skills {
            lines.push(format!(
                "  <skill available=\"{}\">",
                self.check_requirements(&skill)
            ));
            lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
            lines.push(format!(
                "    <description>{}</description>",
                escape_xml(&skill.description)
            ));
            lines.push(format!(
                "    <location>{}</location>",
                escape_xml(&skill.path)
            ));
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }

    /// Full content of the named skills, for inlining.
    pub fn load_skills_for_context(&self, names: &[String]) -> String {
        names
            .iter()
            .filter_map(|name| self.load_skill(name))
            .map(|skill| format!("### Skill: {}\n\n{}", skill.name, skill.content))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// Names of skills marked `always: true` whose requirements are met.
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills()
            .into_iter()
            .filter_map(|info| self.load_skill(&info.name))
            .filter(|skill| skill.metadata.always && self.check_requirements(skill))
            .map(|skill| skill.name)
            .collect()
    }

    /// Check required binaries and environment variables.
    pub fn check_requirements(&self, skill: &Skill) -> bool {
        let req = &skill.metadata.requires;
        req.bins.iter().all(|b| binary_in_path(b)) && req.env.iter().all(|e| std::env::var(e).is_ok())
    }
}

fn parse_skill_file(path: &Path, fallback_name: &str, source: &str) -> Option<Skill> {
    let raw = std::fs::read_to_string(path).ok()?;
    let (metadata, body) = parse_frontmatter(&raw);

    let name = if metadata.name.trim().is_empty() {
        fallback_name.to_string()
    } else {
        metadata.name.clone()
    };
    let description = if metadata.description.trim().is_empty() {
        format!("Skill '{}'", name)
    } else {
        metadata.description.clone()
    };

    Some(Skill {
        name,
        description,
        path: path.to_string_lossy().to_string(),
        source: source.to_string(),
        metadata,
        content: body,
    })
}

fn parse_frontmatter(content: &str) -> (SkillMetadata, String) {
    let captures = FRONTMATTER.as_ref().and_then(|re| re.captures(content));
    if let Some(captures) = captures {
        if let (Some(frontmatter), Some(full)) = (captures.get(1), captures.get(0)) {
            let metadata = match serde_yaml::from_str::<SkillMetadata>(frontmatter.as_str()) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("Failed to parse skill frontmatter: {}", e);
                    SkillMetadata::default()
                }
            };
            return (metadata, content[full.end()..].trim().to_string());
        }
    }
    (SkillMetadata::default(), content.to_string())
}

fn default_builtin_skills_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|p| p.join(BUILTIN_SKILLS_DIR)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(BUILTIN_SKILLS_DIR))
}

fn collect_skill_infos(
    dir: &Path,
    source: &str,
    output: &mut Vec<SkillInfo>,
    seen: &mut HashSet<String>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let skill_file = path.join("SKILL.md");
        if seen.contains(&name) || !skill_file.is_file() {
            continue;
        }
        seen.insert(name.clone());
        output.push(SkillInfo {
            name,
            path: skill_file.to_string_lossy().to_string(),
            source: source.to_string(),
        });
    }
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn binary_in_path(bin: &str) -> bool {
    if bin.trim().is_empty() {
        return false;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(bin).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(root: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(root.join(name)).unwrap();
        std::fs::write(root.join(name).join("SKILL.md"), body).unwrap();
    }

    fn loader(temp: &TempDir) -> SkillsLoader {
        SkillsLoader::new(temp.path().join("ws"), Some(temp.path().join("builtin")))
    }

    #[test]
    fn test_parse_frontmatter() {
        let content = "---\nname: weather\ndescription: Weather helper\nalways: true\n---\n# Weather\n\nUse wttr.in.\n";
        let (meta, body) = parse_frontmatter(content);
        assert_eq!(meta.name, "weather");
        assert!(meta.always);
        assert!(body.starts_with("# Weather"));
    }

    #[test]
    fn test_parse_without_frontmatter() {
        let (meta, body) = parse_frontmatter("# Just markdown");
        assert!(meta.name.is_empty());
        assert_eq!(body, "# Just markdown");
    }

    #[test]
    fn test_workspace_overrides_builtin() {
        let temp = TempDir::new().unwrap();
        write_skill(&temp.path().join("ws"), "demo", "---\ndescription: workspace\n---\nws");
        write_skill(&temp.path().join("builtin"), "demo", "---\ndescription: builtin\n---\nbi");

        let skill = loader(&temp).load_skill("demo").unwrap();
        assert_eq!(skill.source, "workspace");
        assert_eq!(skill.name, "demo");
        assert_eq!(skill.description, "workspace");
    }

    #[test]
    fn test_summary_and_always_skills() {
        let temp = TempDir::new().unwrap();
        let ws = temp.path().join("ws");
        write_skill(&ws, "notes", "---\nname: notes\ndescription: Take <notes>\nalways: true\n---\nWrite things down.");
        write_skill(&ws, "git", "---\nname: git\ndescription: Git helper\n---\nUse git.");
        write_skill(
            &ws,
            "gated",
            "---\nname: gated\nalways: true\nrequires:\n  env: [PICOCLAW_TEST_NEVER_SET]\n---\nx",
        );

        let loader = loader(&temp);
        assert_eq!(loader.get_always_skills(), vec!["notes"]);

        let summary = loader.build_skills_summary(&["notes".to_string()]);
        assert!(summary.starts_with("<skills>"));
        assert!(summary.contains("<name>git</name>"));
        assert!(!summary.contains("<name>notes</name>"));
        assert!(summary.contains("<skill available=\"false\">"));

        let inlined = loader.load_skills_for_context(&["notes".to_string()]);
        assert!(inlined.contains("### Skill: notes"));
        assert!(inlined.contains("Write things down."));
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("<a & b>"), "&lt;a &amp; b&gt;");
    }

    #[test]
    fn test_empty_dirs() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp);
        assert!(loader.list_skills().is_empty());
        assert_eq!(loader.build_skills_summary(&[]), "");
    }
}
