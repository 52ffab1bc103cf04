//! Durable session storage
//!
//! Each session key maps to one append-only JSONL file. Every mutation is a
//! single [`LogRecord`] line, so replaying the file reconstructs the full
//! history and the consolidation mark. [`SessionStore::write_snapshot`]
//! rewrites a file atomically as the minimal record sequence for the current
//! state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::types::{Message, Session};
use crate::error::{PicoError, Result};

const LOG_EXTENSION: &str = "jsonl";

/// One line of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Meta {
        key: String,
        created_at: DateTime<Utc>,
        #[serde(default)]
        epoch: u64,
    },
    Message {
        message: Message,
    },
    Compacted {
        start: usize,
        end: usize,
        summary: String,
    },
    Consolidated {
        count: usize,
    },
    Cleared,
}

/// Directory of per-session JSONL logs.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", encode_key(key), LOG_EXTENSION))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    /// Append records to a session's log, writing a `Meta` header first when
    /// the file is new.
    pub async fn append(&self, session: &Session, records: &[LogRecord]) -> Result<()> {
        let path = self.path_for(&session.key);
        let mut buf = Vec::new();
        if !path.exists() {
            // Clears in this batch bump the generation again on replay.
            let clears = records
                .iter()
                .filter(|r| matches!(r, LogRecord::Cleared))
                .count() as u64;
            push_line(
                &mut buf,
                &LogRecord::Meta {
                    key: session.key.clone(),
                    created_at: session.created_at,
                    epoch: session.epoch.saturating_sub(clears),
                },
            )?;
        }
        for record in records {
            push_line(&mut buf, record)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(&buf).await.map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    /// Replay a session's log. Returns `None` if there is no log for `key`.
    ///
    /// Lines that fail to parse (e.g. a torn final write) are skipped.
    pub async fn load(&self, key: &str) -> Result<Option<Session>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(Some(replay(key, &content)))
    }

    /// Atomically replace the log with a snapshot of `session`.
    pub async fn write_snapshot(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.key);
        self.write_atomic(&path, snapshot_records(session)).await
    }

    /// Write a snapshot of `session` under `archive/` and return its path.
    pub async fn archive(&self, session: &Session) -> Result<PathBuf> {
        let archive_dir = self.dir.join("archive");
        tokio::fs::create_dir_all(&archive_dir)
            .await
            .map_err(|e| io_error(&archive_dir, e))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = archive_dir.join(format!(
            "{}-{}.{}",
            encode_key(&session.key),
            stamp,
            LOG_EXTENSION
        ));
        self.write_atomic(&path, snapshot_records(session)).await?;
        Ok(path)
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Keys of every session with a log on disk.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == LOG_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(decode_key(stem));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn write_atomic(&self, path: &Path, records: Vec<LogRecord>) -> Result<()> {
        let mut buf = Vec::new();
        for record in &records {
            push_line(&mut buf, record)?;
        }
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.clone());
        let target = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&buf)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| PicoError::SessionIo(format!("snapshot task failed: {}", e)))?
        .map_err(|e| io_error(path, e))
    }
}

fn push_line(buf: &mut Vec<u8>, record: &LogRecord) -> Result<()> {
    serde_json::to_writer(&mut *buf, record)?;
    buf.push(b'\n');
    Ok(())
}

fn io_error(path: &Path, e: std::io::Error) -> PicoError {
    PicoError::SessionIo(format!("{}: {}", path.display(), e))
}

/// Minimal record sequence that replays to `session`.
pub fn snapshot_records(session: &Session) -> Vec<LogRecord> {
    let mut records = Vec::with_capacity(session.messages.len() + 2);
    records.push(LogRecord::Meta {
        key: session.key.clone(),
        created_at: session.created_at,
        epoch: session.epoch,
    });
    records.extend(
        session
            .messages
            .iter()
            .cloned()
            .map(|message| LogRecord::Message { message }),
    );
    if session.consolidated_count > 0 {
        records.push(LogRecord::Consolidated {
            count: session.consolidated_count,
        });
    }
    records
}

/// Rebuild a session from log text.
pub fn replay(key: &str, content: &str) -> Session {
    let mut session = Session::new(key);
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(session = key, line = lineno + 1, error = %e, "Skipping unreadable session record");
                continue;
            }
        };
        match record {
            LogRecord::Meta {
                created_at, epoch, ..
            } => {
                session.created_at = created_at;
                session.epoch = epoch;
            }
            LogRecord::Message { message } => session.messages.push(message),
            LogRecord::Compacted {
                start,
                end,
                summary,
            } => {
                if !session.compact_span(start, end, &summary) {
                    warn!(session = key, start, end, "Ignoring out-of-range compaction record");
                }
            }
            LogRecord::Consolidated { count } => {
                session.mark_consolidated(count);
            }
            LogRecord::Cleared => session.clear(),
        }
    }
    session
}

/// Percent-encode a session key into a filename. Reversible via
/// [`decode_key`], so distinct keys never share a file.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub fn decode_key(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
