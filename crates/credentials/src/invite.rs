use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AuthError;

/// Base32 alphabet for invite tokens — no `0/O/1/l/I` so tokens survive
/// being read aloud or handwritten.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Active,
    Consumed,
    Expired,
    Revoked,
}

/// An invite token at rest. The plaintext token is returned exactly once at
/// creation; only its SHA-256 is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteToken {
    pub token_hash: String,
    pub max_uses: u32,
    pub used_count: u32,
    pub expires_at: DateTime<Utc>,
    pub status: InviteStatus,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InviteOptions {
    pub max_uses: u32,
    pub ttl_days: i64,
    pub label: String,
}

impl Default for InviteOptions {
    fn default() -> Self {
        Self {
            max_uses: 1,
            ttl_days: 7,
            label: String::new(),
        }
    }
}

/// Generate a fresh `dbot-XXXX-XXXX-XXXX-XXXX` token.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut groups = Vec::with_capacity(4);
    for _ in 0..4 {
        let group: String = (0..4)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();
        groups.push(group);
    }
    format!("dbot-{}", groups.join("-"))
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// JSON-file-backed invite token store.
pub struct InviteStore {
    path: PathBuf,
}

impl InviteStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create an invite. Returns the plaintext token — the only time it is
    /// ever visible — alongside the stored record.
    pub fn create(&self, options: InviteOptions, now: DateTime<Utc>) -> Result<(String, InviteToken)> {
        let token = generate_token();
        let record = InviteToken {
            token_hash: hash_token(&token),
            max_uses: options.max_uses.max(1),
            used_count: 0,
            expires_at: now + Duration::days(options.ttl_days),
            status: InviteStatus::Active,
            label: options.label,
            created_at: now,
        };

        let mut all = self.load()?;
        all.push(record.clone());
        self.store(&all)?;
        Ok((token, record))
    }

    /// Redeem one use of a token. The final permitted use flips the record to
    /// `consumed`; after that (or past expiry) redemption fails.
    pub fn redeem(&self, token: &str, now: DateTime<Utc>) -> Result<InviteToken, AuthError> {
        let hash = hash_token(token);
        let mut all = self.load().map_err(|e| AuthError::Storage(e.to_string()))?;
        let Some(record) = all.iter_mut().find(|r| r.token_hash == hash) else {
            return Err(AuthError::InviteInvalid);
        };

        match record.status {
            InviteStatus::Revoked => return Err(AuthError::InviteInvalid),
            InviteStatus::Consumed => return Err(AuthError::InviteConsumed),
            InviteStatus::Expired => return Err(AuthError::InviteExpired),
            InviteStatus::Active => {}
        }
        if now > record.expires_at {
            record.status = InviteStatus::Expired;
            self.store(&all).map_err(|e| AuthError::Storage(e.to_string()))?;
            return Err(AuthError::InviteExpired);
        }

        record.used_count += 1;
        if record.used_count >= record.max_uses {
            record.status = InviteStatus::Consumed;
        }
        let snapshot = record.clone();
        self.store(&all).map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn revoke(&self, token_hash: &str) -> Result<bool> {
        let mut all = self.load()?;
        let mut found = false;
        for record in &mut all {
            if record.token_hash == token_hash {
                record.status = InviteStatus::Revoked;
                found = true;
            }
        }
        if found {
            self.store(&all)?;
        }
        Ok(found)
    }

    pub fn list(&self) -> Result<Vec<InviteToken>> {
        self.load()
    }

    fn load(&self) -> Result<Vec<InviteToken>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    fn store(&self, all: &[InviteToken]) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_string_pretty(all)?)
    }
}

/// tmp + rename write shared by the JSON stores in this crate.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
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
