//! Conversation threads, mental models, and the research cache — everything
//! persisted under `~/.bot/memory/`.
//!
//! Threads are append-only JSONL transcripts with an archive tier. Mental
//! models are structured beliefs mutated exclusively through deltas. The
//! research cache indexes markdown artifacts agents produced earlier.

mod model;
mod research;
mod thread;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

pub use model::{DeltaFields, MemoryDelta, MentalModel, ModelStore, apply_delta};
pub use research::{ResearchCache, ResearchEntry};
pub use thread::{ThreadMessage, ThreadMeta, ThreadStore};

/// Bundles the three stores over one memory root.
pub struct MemoryStore {
    pub threads: ThreadStore,
    pub models: ModelStore,
    pub research: ResearchCache,
}

impl MemoryStore {
    pub fn open(memory_root: impl AsRef<Path>) -> Self {
        let root = memory_root.as_ref();
        Self {
            threads: ThreadStore::open(root),
            models: ModelStore::open(root),
            research: ResearchCache::open(root),
        }
    }
}

/// tmp + rename write used by every store in this crate. A crash mid-write
/// leaves the previous file intact.
pub(crate) fn write_atomic(path: &PathBuf, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
