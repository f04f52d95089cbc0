use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

const VAULT_VERSION: &str = "1";

/// On-disk shape of `~/.bot/vault.json`. Values are server-encrypted blobs
/// carrying a `srv:` prefix; this store never inspects them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    version: String,
    credentials: BTreeMap<String, String>,
}

impl Default for VaultFile {
    fn default() -> Self {
        Self {
            version: VAULT_VERSION.to_string(),
            credentials: BTreeMap::new(),
        }
    }
}

/// Handle to the credential vault file.
///
/// Reads go through an in-handle cache invalidated on every write. Writes
/// rewrite the whole file via tmp + fsync + rename while holding an advisory
/// lock on a `.lock` sibling, so two processes never interleave writers.
pub struct CredentialVault {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, String>>>,
}

impl CredentialVault {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.snapshot()?.get(key).cloned())
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.snapshot()?.contains_key(key))
    }

    /// Key names only. Values never cross this boundary.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.keys().cloned().collect())
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|credentials| {
            credentials.insert(key.to_string(), value.to_string());
        })
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut existed = false;
        self.mutate(|credentials| {
            existed = credentials.remove(key).is_some();
        })?;
        Ok(existed)
    }

    fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref map) = *cache {
            return Ok(map.clone());
        }
        let map = self.load_from_disk();
        *cache = Some(map.clone());
        Ok(map)
    }

    fn load_from_disk(&self) -> BTreeMap<String, String> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<VaultFile>(&raw) {
            Ok(file) if file.version == VAULT_VERSION => file.credentials,
            Ok(file) => {
                warn!(version = %file.version, "vault version mismatch — treating as empty");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(%err, path = %self.path.display(), "malformed vault file — treating as empty");
                BTreeMap::new()
            }
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Advisory lock on a sibling so readers never see a torn file and
        // writers never interleave.
        let lock_path = self.path.with_extension("json.lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = (|| -> Result<()> {
            let mut credentials = self.load_from_disk();
            apply(&mut credentials);

            let rendered = serde_json::to_string_pretty(&VaultFile {
                version: VAULT_VERSION.to_string(),
                credentials,
            })?;

            let tmp_path = self.path.with_extension("json.tmp");
            {
                let mut tmp = fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?;
                tmp.write_all(rendered.as_bytes())?;
                tmp.flush()?;
                tmp.sync_all()?;
            }
            if let Err(err) = fs::rename(&tmp_path, &self.path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
            Ok(())
        })();

        // The cache is stale after any write attempt, success or not.
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }
}
