//! Workspace memory (markdown files under `<workspace>/memory/`).
//!
//! - `MEMORY.md`: long-term facts, rewritten wholesale by consolidation
//! - `YYYY-MM-DD.md`: daily notes, append-only

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PicoError, Result};

pub const LONG_TERM_FILE: &str = "MEMORY.md";

/// Handle to the memory directory of one workspace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("memory"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn long_term_path(&self) -> PathBuf {
        self.dir.join(LONG_TERM_FILE)
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn today_path(&self) -> PathBuf {
        self.daily_path(Local::now().date_naive())
    }

    /// Current long-term memory; empty when the file does not exist.
    pub async fn read_long_term(&self) -> Result<String> {
        read_or_empty(&self.long_term_path()).await
    }

    /// Atomically replace `MEMORY.md`.
    pub async fn write_long_term(&self, content: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dir = self.dir.clone();
        let target = self.long_term_path();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| PicoError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| PicoError::Io(std::io::Error::other(e)))??;
        debug!(path = %self.long_term_path().display(), "Updated long-term memory");
        Ok(())
    }

    /// Append an entry to today's note, creating it with a date heading.
    pub async fn append_today(&self, entry: &str) -> Result<()> {
        self.append_daily(Local::now().date_naive(), entry).await
    }

    pub async fn append_daily(&self, date: NaiveDate, entry: &str) -> Result<()> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.daily_path(date);
        let is_new = !path.exists();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut text = String::new();
        if is_new {
            text.push_str(&format!("# {}\n", date.format("%Y-%m-%d")));
        }
        text.push_str(&format!("\n{}\n", entry));
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Paths of the daily notes for the last `days` days, newest first.
    pub fn recent_daily_paths(&self, days: u32) -> Vec<PathBuf> {
        let today = Local::now().date_naive();
        (0..days)
            .filter_map(|offset| today.checked_sub_days(chrono::Days::new(offset as u64)))
            .map(|date| self.daily_path(date))
            .collect()
    }
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_long_term_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(dir.path());
        assert_eq!(store.read_long_term().await.unwrap(), "");

        store.write_long_term("likes rust").await.unwrap();
        assert_eq!(store.read_long_term().await.unwrap(), "likes rust");
        store.write_long_term("likes tokio").await.unwrap();
        assert_eq!(store.read_long_term().await.unwrap(), "likes tokio");
    }

    #[tokio::test]
    async fn test_append_daily_adds_heading_once() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        store.append_daily(date, "first").await.unwrap();
        store.append_daily(date, "  ").await.unwrap();
        store.append_daily(date, "second").await.unwrap();

        let text = std::fs::read_to_string(store.daily_path(date)).unwrap();
        assert_eq!(text.matches("# 2026-03-01").count(), 1);
        assert!(text.contains("first"));
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
    }

    #[test]
    fn test_recent_daily_paths() {
        let store = MemoryStore::new(Path::new("/ws"));
        let paths = store.recent_daily_paths(3);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], store.today_path());
        assert!(store.recent_daily_paths(0).is_empty());
    }
}
