use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::write_atomic;

/// Metadata for one conversation thread, kept in `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub thread_id: String,
    pub topic: String,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

/// One persisted turn. Threads are append-only; edits never happen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ThreadIndex {
    threads: Vec<ThreadMeta>,
}

/// Append-only conversation threads under `memory/threads/`, with archived
/// threads relocated to `threads/archive/` — searchable but out of the hot
/// set.
pub struct ThreadStore {
    root: PathBuf,
}

impl ThreadStore {
    pub fn open(memory_root: impl Into<PathBuf>) -> Self {
        Self { root: memory_root.into() }
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn threads_dir(&self) -> PathBuf {
        self.root.join("threads")
    }

    fn archive_dir(&self) -> PathBuf {
        self.threads_dir().join("archive")
    }

    fn thread_file(&self, meta: &ThreadMeta) -> PathBuf {
        let dir = if meta.archived { self.archive_dir() } else { self.threads_dir() };
        dir.join(format!("{}.jsonl", meta.thread_id))
    }

    /// Create a new thread and return its id.
    pub fn create(&self, topic: &str, now: DateTime<Utc>) -> Result<String> {
        let thread_id = format!("th-{}", Uuid::new_v4());
        let mut index = self.load_index();
        index.threads.push(ThreadMeta {
            thread_id: thread_id.clone(),
            topic: topic.to_string(),
            last_active: now,
            archived: false,
        });
        self.store_index(&index)?;
        Ok(thread_id)
    }

    /// Append one message, bumping `last_active`.
    pub fn append(&self, thread_id: &str, message: &ThreadMessage) -> Result<()> {
        let mut index = self.load_index();
        let meta = index
            .threads
            .iter_mut()
            .find(|t| t.thread_id == thread_id)
            .with_context(|| format!("unknown thread {thread_id}"))?;
        meta.last_active = message.timestamp;
        let path = {
            let snapshot = meta.clone();
            self.thread_file(&snapshot)
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(message)?;
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;

        self.store_index(&index)?;
        Ok(())
    }

    /// All messages of a thread, in append order. Corrupt lines are skipped
    /// with a warning instead of failing the read.
    pub fn messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let index = self.load_index();
        let Some(meta) = index.threads.iter().find(|t| t.thread_id == thread_id) else {
            return Ok(Vec::new());
        };
        let path = self.thread_file(meta);
        read_jsonl(&path)
    }

    /// Non-archived threads, most recently active first.
    pub fn hot(&self) -> Vec<ThreadMeta> {
        let mut threads: Vec<ThreadMeta> = self
            .load_index()
            .threads
            .into_iter()
            .filter(|t| !t.archived)
            .collect();
        threads.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        threads
    }

    /// Move a thread out of the hot set.
    pub fn archive(&self, thread_id: &str) -> Result<()> {
        let mut index = self.load_index();
        let meta = index
            .threads
            .iter_mut()
            .find(|t| t.thread_id == thread_id)
            .with_context(|| format!("unknown thread {thread_id}"))?;
        if meta.archived {
            return Ok(());
        }

        let from = {
            let mut live = meta.clone();
            live.archived = false;
            self.thread_file(&live)
        };
        meta.archived = true;
        let to = {
            let snapshot = meta.clone();
            self.thread_file(&snapshot)
        };
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if from.exists() {
            fs::rename(&from, &to)?;
        }
        self.store_index(&index)?;
        Ok(())
    }

    /// Keyword search over archived threads only: topic match or any message
    /// containing the keyword (case-insensitive).
    pub fn search_archive(&self, keyword: &str) -> Result<Vec<ThreadMeta>> {
        let needle = keyword.to_lowercase();
        let mut hits = Vec::new();
        for meta in self.load_index().threads.into_iter().filter(|t| t.archived) {
            if meta.topic.to_lowercase().contains(&needle) {
                hits.push(meta);
                continue;
            }
            let messages = read_jsonl(&self.thread_file(&meta))?;
            if messages.iter().any(|m| m.content.to_lowercase().contains(&needle)) {
                hits.push(meta);
            }
        }
        Ok(hits)
    }

    fn load_index(&self) -> ThreadIndex {
        let Ok(raw) = fs::read_to_string(self.index_path()) else {
            return ThreadIndex::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(%err, "corrupt thread index — starting empty");
            ThreadIndex::default()
        })
    }

    fn store_index(&self, index: &ThreadIndex) -> Result<()> {
        write_atomic(&self.index_path(), &serde_json::to_string_pretty(index)?)
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<ThreadMessage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut messages = Vec::new();
    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ThreadMessage>(&line) {
            Ok(message) => messages.push(message),
            Err(err) => warn!(
                line = line_idx + 1,
                %err,
                path = %path.display(),
                "corrupt thread line — skipping"
            ),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ThreadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::open(dir.path());
        (dir, store)
    }

    fn msg(role: &str, content: &str) -> ThreadMessage {
        ThreadMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn create_append_read_back() {
        let (_dir, store) = store();
        let id = store.create("deploy planning", Utc::now()).unwrap();
        store.append(&id, &msg("user", "how do we deploy?")).unwrap();
        store.append(&id, &msg("assistant", "with care")).unwrap();

        let messages = store.messages(&id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "with care");
    }

    #[test]
    fn hot_excludes_archived_and_sorts_by_recency() {
        let (_dir, store) = store();
        let old = store.create("old", Utc::now()).unwrap();
        let new = store.create("new", Utc::now()).unwrap();
        store.append(&old, &msg("user", "a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.append(&new, &msg("user", "b")).unwrap();

        store.archive(&old).unwrap();
        let hot = store.hot();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].thread_id, new);
    }

    #[test]
    fn archived_threads_remain_searchable() {
        let (_dir, store) = store();
        let id = store.create("zebra migration", Utc::now()).unwrap();
        store.append(&id, &msg("user", "the herd moves at dawn")).unwrap();
        store.archive(&id).unwrap();

        assert_eq!(store.search_archive("herd").unwrap().len(), 1);
        assert_eq!(store.search_archive("zebra").unwrap().len(), 1);
        assert!(store.search_archive("penguin").unwrap().is_empty());
        // Hot search does not see it.
        assert!(store.hot().is_empty());
    }

    #[test]
    fn archive_is_idempotent_and_moves_the_file() {
        let (dir, store) = store();
        let id = store.create("t", Utc::now()).unwrap();
        store.append(&id, &msg("user", "x")).unwrap();
        store.archive(&id).unwrap();
        store.archive(&id).unwrap();
        assert!(dir
            .path()
            .join("threads/archive")
            .join(format!("{id}.jsonl"))
            .exists());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (dir, store) = store();
        let id = store.create("t", Utc::now()).unwrap();
        store.append(&id, &msg("user", "good")).unwrap();
        let path = dir.path().join("threads").join(format!("{id}.jsonl"));
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{broken\n");
        fs::write(&path, raw).unwrap();

        let messages = store.messages(&id).unwrap();
        assert_eq!(messages.len(), 1);
    }
}
