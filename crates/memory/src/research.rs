use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::write_atomic;

/// One cached research artifact: a markdown file plus index metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchEntry {
    pub filename: String,
    pub topic: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ResearchIndex {
    entries: Vec<ResearchEntry>,
}

/// `memory/research-cache/` — markdown files with an `index.json` the tailor
/// scans when picking `relevant_cache` filenames.
pub struct ResearchCache {
    dir: PathBuf,
}

impl ResearchCache {
    pub fn open(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: memory_root.into().join("research-cache"),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    /// Store a markdown artifact under a slug derived from the topic.
    pub fn put(&self, topic: &str, markdown: &str, now: DateTime<Utc>) -> Result<String> {
        let filename = format!("{}.md", slug(topic));
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(&filename), markdown)?;

        let mut index = self.load_index();
        index.entries.retain(|e| e.filename != filename);
        index.entries.push(ResearchEntry {
            filename: filename.clone(),
            topic: topic.to_string(),
            created_at: now,
        });
        write_atomic(&self.index_path(), &serde_json::to_string_pretty(&index)?)?;
        Ok(filename)
    }

    pub fn get(&self, filename: &str) -> Result<Option<String>> {
        let path = self.dir.join(filename);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Index entries, newest first.
    pub fn list(&self) -> Vec<ResearchEntry> {
        let mut entries = self.load_index().entries;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    fn load_index(&self) -> ResearchIndex {
        let Ok(raw) = fs::read_to_string(self.index_path()) else {
            return ResearchIndex::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(%err, "corrupt research cache index — starting empty");
            ResearchIndex::default()
        })
    }
}

fn slug(topic: &str) -> String {
    let mut out: String = topic
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}
