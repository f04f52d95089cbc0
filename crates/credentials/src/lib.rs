//! Device credentials: the vault file, invite tokens, device registry, and
//! browser-setup sessions.
//!
//! Everything here is storage for secrets the rest of the system consumes —
//! enumeration never exposes values, plaintext tokens surface exactly once,
//! and the local device secret is readable at most once per provisioning.

mod device;
mod invite;
mod session;
mod vault;

use thiserror::Error;

pub use device::{
    AuthOutcome, Device, DeviceCredentialFile, DeviceRegistry, DeviceStatus, hash_secret,
};
pub use invite::{
    InviteOptions, InviteStatus, InviteStore, InviteToken, generate_token, hash_token,
};
pub use session::{SessionCipher, SessionPayload, SessionStore};
pub use vault::CredentialVault;

/// Authentication failures surfaced to transport. Variant names map straight
/// onto the wire-level error codes.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("device_revoked")]
    DeviceRevoked,
    #[error("unknown_device")]
    UnknownDevice,
    #[error("bad_secret")]
    BadSecret,
    #[error("invite_invalid")]
    InviteInvalid,
    #[error("invite_consumed")]
    InviteConsumed,
    #[error("invite_expired")]
    InviteExpired,
    #[error("session_invalid")]
    SessionInvalid,
    #[error("session_expired")]
    SessionExpired,
    #[error("credential storage error: {0}")]
    Storage(String),
}
