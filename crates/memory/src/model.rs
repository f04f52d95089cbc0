use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::write_atomic;

/// How many recent dialog lines a model retains.
const RECENT_DIALOG_CAP: usize = 20;
/// Bounded spine cache in front of the model files.
const SPINE_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(128).unwrap();
/// Confidence bump applied by every delta application.
const DELTA_CONFIDENCE_STEP: f32 = 0.05;

/// A persistent structured belief about one entity (person, project, API…).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentalModel {
    pub id: String,
    pub entity: String,
    pub r#type: String,
    #[serde(default)]
    pub subtype: String,
    /// Keys that `attributes` may populate.
    #[serde(default)]
    pub schema: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub beliefs: Vec<String>,
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub recent_dialog: Vec<String>,
    pub confidence: f32,
    pub last_updated: DateTime<Utc>,
}

impl MentalModel {
    pub fn new(entity: &str, r#type: &str, schema: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("mm-{}", Uuid::new_v4()),
            entity: entity.to_string(),
            r#type: r#type.to_string(),
            subtype: String::new(),
            schema,
            attributes: BTreeMap::new(),
            relationships: Vec::new(),
            beliefs: Vec::new(),
            open_loops: Vec::new(),
            constraints: Vec::new(),
            recent_dialog: Vec::new(),
            confidence: 0.1,
            last_updated: now,
        }
    }

    /// One-line summary used in prompts without loading the whole model.
    pub fn spine(&self) -> String {
        let attrs = self
            .attributes
            .iter()
            .take(4)
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let loops = if self.open_loops.is_empty() {
            String::new()
        } else {
            format!("; open: {}", self.open_loops.join(" | "))
        };
        format!(
            "[{} {}] {}{} (confidence {:.2})",
            self.r#type, self.entity, attrs, loops, self.confidence
        )
    }
}

/// The only mutation path for a mental model. Additions land in the named
/// collections; deductions remove matching entries; the summary joins
/// `recent_dialog`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDelta {
    /// `attributes` additions keyed by schema key, plus free-form additions
    /// to beliefs / open_loops / constraints / relationships.
    #[serde(default)]
    pub additions: DeltaFields,
    #[serde(default)]
    pub deductions: DeltaFields,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaFields {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub beliefs: Vec<String>,
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<String>,
}

/// Apply a delta in place.
///
/// Attribute keys outside the schema are dropped with a warning (the
/// schema-subset invariant holds by construction). Afterwards confidence
/// rises by 0.05, saturating at 1.0 — monotone non-decreasing across any
/// sequence of applications.
pub fn apply_delta(model: &mut MentalModel, delta: &MemoryDelta, now: DateTime<Utc>) {
    for (key, value) in &delta.additions.attributes {
        if model.schema.contains(key) {
            model.attributes.insert(key.clone(), value.clone());
        } else {
            warn!(entity = %model.entity, key = %key, "delta attribute outside schema — dropped");
        }
    }
    append_unique(&mut model.beliefs, &delta.additions.beliefs);
    append_unique(&mut model.open_loops, &delta.additions.open_loops);
    append_unique(&mut model.constraints, &delta.additions.constraints);
    append_unique(&mut model.relationships, &delta.additions.relationships);

    for key in delta.deductions.attributes.keys() {
        model.attributes.remove(key);
    }
    remove_matching(&mut model.beliefs, &delta.deductions.beliefs);
    remove_matching(&mut model.open_loops, &delta.deductions.open_loops);
    remove_matching(&mut model.constraints, &delta.deductions.constraints);
    remove_matching(&mut model.relationships, &delta.deductions.relationships);

    if !delta.summary.is_empty() {
        model.recent_dialog.push(delta.summary.clone());
        let overflow = model.recent_dialog.len().saturating_sub(RECENT_DIALOG_CAP);
        if overflow > 0 {
            model.recent_dialog.drain(..overflow);
        }
    }

    model.confidence = (model.confidence + DELTA_CONFIDENCE_STEP).min(1.0);
    model.last_updated = now;
}

fn append_unique(target: &mut Vec<String>, additions: &[String]) {
    for item in additions {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn remove_matching(target: &mut Vec<String>, deductions: &[String]) {
    target.retain(|item| !deductions.contains(item));
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// Mental models persisted one JSON file each under `memory/models/`, with a
/// bounded LRU spine cache in front for prompt assembly.
pub struct ModelStore {
    dir: PathBuf,
    spines: Mutex<LruCache<String, String>>,
}

impl ModelStore {
    pub fn open(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: memory_root.into().join("models"),
            spines: Mutex::new(LruCache::new(SPINE_CACHE_SIZE)),
        }
    }

    pub fn save(&self, model: &MentalModel) -> Result<()> {
        let path = self.dir.join(format!("{}.json", model.id));
        write_atomic(&path, &serde_json::to_string_pretty(model)?)?;
        self.spines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(model.id.clone(), model.spine());
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<MentalModel>> {
        let path = self.dir.join(format!("{id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(model) => Ok(Some(model)),
            Err(err) => {
                warn!(%err, id, "corrupt mental model file — ignoring");
                Ok(None)
            }
        }
    }

    /// Apply a delta to a stored model and persist the result.
    pub fn apply(&self, id: &str, delta: &MemoryDelta, now: DateTime<Utc>) -> Result<MentalModel> {
        let mut model = self
            .load(id)?
            .with_context(|| format!("unknown mental model {id}"))?;
        apply_delta(&mut model, delta, now);
        self.save(&model)?;
        Ok(model)
    }

    pub fn all(&self) -> Result<Vec<MentalModel>> {
        let mut models = Vec::new();
        if !self.dir.exists() {
            return Ok(models);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(raw) = fs::read_to_string(&path) {
                    if let Ok(model) = serde_json::from_str::<MentalModel>(&raw) {
                        models.push(model);
                    }
                }
            }
        }
        models.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(models)
    }

    /// Spine for a model, via the cache where possible.
    pub fn spine(&self, id: &str) -> Result<Option<String>> {
        if let Some(spine) = self
            .spines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
        {
            return Ok(Some(spine));
        }
        let Some(model) = self.load(id)? else {
            return Ok(None);
        };
        let spine = model.spine();
        self.spines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(id.to_string(), spine.clone());
        Ok(Some(spine))
    }

    /// Spines for every stored model (prompt assembly for the tailor and the
    /// pipeline context build).
    pub fn spines(&self) -> Result<Vec<String>> {
        Ok(self.all()?.iter().map(MentalModel::spine).collect())
    }

    /// Find models whose entity matches (case-insensitive).
    pub fn find_by_entity(&self, entity: &str) -> Result<Vec<MentalModel>> {
        let needle = entity.to_lowercase();
        Ok(self
            .all()?
            .into_iter()
            .filter(|m| m.entity.to_lowercase().contains(&needle))
            .collect())
    }
}
