use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AuthError;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Payload sealed into the browser-setup cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub device_id: String,
    pub device_secret: String,
}

/// AES-256-GCM cipher for the browser-setup cookie, keyed with a fresh
/// random key per process. Cookies do not survive a restart, which is the
/// point: the cookie only bridges the browser hand-off.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new() -> Self {
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Produce `<iv_hex>:<auth_tag_hex>:<ciphertext_hex>`.
    pub fn seal(&self, payload: &SessionPayload) -> Result<String, AuthError> {
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| AuthError::Storage(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext; the cookie
        // format carries it as its own segment.
        let mut combined = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| AuthError::SessionInvalid)?;
        let tag = combined.split_off(combined.len() - TAG_SIZE);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(tag),
            hex::encode(combined)
        ))
    }

    pub fn open(&self, cookie: &str) -> Result<SessionPayload, AuthError> {
        let parts: Vec<&str> = cookie.split(':').collect();
        if parts.len() != 3 {
            return Err(AuthError::SessionInvalid);
        }
        let nonce_bytes = hex::decode(parts[0]).map_err(|_| AuthError::SessionInvalid)?;
        let tag = hex::decode(parts[1]).map_err(|_| AuthError::SessionInvalid)?;
        let mut ciphertext = hex::decode(parts[2]).map_err(|_| AuthError::SessionInvalid)?;
        if nonce_bytes.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(AuthError::SessionInvalid);
        }

        ciphertext.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| AuthError::SessionInvalid)?;
        serde_json::from_slice(&plaintext).map_err(|_| AuthError::SessionInvalid)
    }
}

impl Default for SessionCipher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Session tokens ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SessionRecord {
    device_id: String,
    expires_at: DateTime<Utc>,
}

/// In-memory session token table. Tokens are opaque UUIDs with a 30-day
/// default lifetime; validation is constant-time by lookup.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(ttl_days: i64) -> Self {
        Self {
            ttl: Duration::days(ttl_days),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, device_id: &str, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token.clone(),
                SessionRecord {
                    device_id: device_id.to_string(),
                    expires_at: now + self.ttl,
                },
            );
        token
    }

    /// Resolve a token to its device id, expiring lazily.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = sessions.get(token) else {
            return Err(AuthError::SessionInvalid);
        };
        if now > record.expires_at {
            sessions.remove(token);
            return Err(AuthError::SessionExpired);
        }
        Ok(record.device_id.clone())
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    /// Drop every expired session; returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, r| r.expires_at >= now);
        before - sessions.len()
    }
}
