use std::sync::LazyLock;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Byte length of access and refresh keys before encoding (~43 chars).
pub const KEY_NBYTES: usize = 32;

/// Byte length of session ids before encoding.
pub const SESSION_ID_NBYTES: usize = 16;

/// Fixed hash verified on user lookup misses so that "unknown username"
/// and "wrong password" burn the same bcrypt work.
static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| {
    bcrypt::hash("quill-dummy-password", bcrypt::DEFAULT_COST)
        .expect("bcrypt rejected the dummy password")
});

/// Generate an opaque url-safe key from `nbytes` of CSPRNG output.
pub fn generate_key(nbytes: usize) -> String {
    let mut bytes = vec![0u8; nbytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")
}

/// Verify a password against a stored bcrypt hash.
/// NOTE: This is a blocking call. Wrap in `tokio::task::spawn_blocking`.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Verify against the dummy hash and discard the result. Called on user
/// lookup misses to keep login latency independent of username existence.
/// NOTE: This is a blocking call. Wrap in `tokio::task::spawn_blocking`.
pub fn equalize_timing(password: &str) {
    let _ = bcrypt::verify(password, &DUMMY_HASH);
}
