use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::AuthError;
use crate::invite::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Revoked,
}

/// A registered device. The secret is the real auth factor; the hardware
/// fingerprint is monitored but never blocks (rotate-and-warn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub secret_hash: String,
    pub hw_fingerprint: String,
    pub status: DeviceStatus,
    pub is_admin: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Result of a successful authentication, noting whether the fingerprint was
/// rotated along the way.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub device: Device,
    pub fingerprint_rotated: bool,
}

/// JSON-file-backed device registry.
pub struct DeviceRegistry {
    path: PathBuf,
}

impl DeviceRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Register a new device. Returns the generated id and plaintext secret;
    /// only the secret's hash is stored.
    pub fn register(
        &self,
        fingerprint: &str,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<(String, String)> {
        let id = format!("dev-{}", Uuid::new_v4());
        let secret = Uuid::new_v4().simple().to_string();
        let device = Device {
            id: id.clone(),
            secret_hash: hash_secret(&secret),
            hw_fingerprint: fingerprint.to_string(),
            status: DeviceStatus::Active,
            is_admin,
            registered_at: now,
            last_seen_at: None,
        };
        let mut all = self.load()?;
        all.push(device);
        self.store(&all)?;
        Ok((id, secret))
    }

    /// Authenticate a device by id + secret.
    ///
    /// Order matters: a revoked device fails with `device_revoked` even when
    /// the secret matches. A fingerprint mismatch rotates the stored value,
    /// logs a security event, and still succeeds.
    pub fn authenticate(
        &self,
        device_id: &str,
        secret: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthOutcome, AuthError> {
        let mut all = self.load().map_err(|e| AuthError::Storage(e.to_string()))?;
        let Some(device) = all.iter_mut().find(|d| d.id == device_id) else {
            return Err(AuthError::UnknownDevice);
        };

        if device.status == DeviceStatus::Revoked {
            return Err(AuthError::DeviceRevoked);
        }
        if device.secret_hash != hash_secret(secret) {
            return Err(AuthError::BadSecret);
        }

        let mut fingerprint_rotated = false;
        if device.hw_fingerprint != fingerprint {
            warn!(
                device_id = %device.id,
                "security event: hardware fingerprint changed — rotating stored fingerprint"
            );
            device.hw_fingerprint = fingerprint.to_string();
            fingerprint_rotated = true;
        }
        device.last_seen_at = Some(now);
        let snapshot = device.clone();
        self.store(&all).map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(AuthOutcome {
            device: snapshot,
            fingerprint_rotated,
        })
    }

    pub fn revoke(&self, device_id: &str) -> Result<bool> {
        let mut all = self.load()?;
        let mut found = false;
        for device in &mut all {
            if device.id == device_id {
                device.status = DeviceStatus::Revoked;
                found = true;
            }
        }
        if found {
            self.store(&all)?;
        }
        Ok(found)
    }

    pub fn get(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.load()?.into_iter().find(|d| d.id == device_id))
    }

    fn load(&self) -> Result<Vec<Device>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    fn store(&self, all: &[Device]) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_string_pretty(all)?)
    }
}

// ── Local device credential file ─────────────────────────────────────────────

/// On-disk shape of `~/.bot/device.json` on the local agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceFile {
    device_id: String,
    /// Cleared after the first read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_secret: Option<String>,
}

/// Single-read access to the local device secret.
///
/// The secret is retrievable at most once per provisioning: `take_secret`
/// returns it and immediately rewrites the file without it, so a later
/// compromise of the file yields only the device id.
pub struct DeviceCredentialFile {
    path: PathBuf,
}

impl DeviceCredentialFile {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn provision(&self, device_id: &str, secret: &str) -> Result<()> {
        let file = DeviceFile {
            device_id: device_id.to_string(),
            device_secret: Some(secret.to_string()),
        };
        write_atomic(&self.path, &serde_json::to_string_pretty(&file)?)
    }

    pub fn device_id(&self) -> Result<Option<String>> {
        Ok(self.read()?.map(|f| f.device_id))
    }

    /// Return the secret and strip it from disk. Second call returns `None`.
    pub fn take_secret(&self) -> Result<Option<String>> {
        let Some(mut file) = self.read()? else {
            return Ok(None);
        };
        let secret = file.device_secret.take();
        if secret.is_some() {
            write_atomic(&self.path, &serde_json::to_string_pretty(&file)?)?;
        }
        Ok(secret)
    }

    fn read(&self) -> Result<Option<DeviceFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw).ok())
    }
}
