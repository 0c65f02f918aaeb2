//! Request fingerprints, cache keys and correlation ids.
//!
//! A fingerprint identifies a request by method, path, sorted parameters and
//! raw body. It is the SHA-256 digest of those parts rendered as lowercase hex
//! and split into dash-separated groups of eight characters, which keeps keys
//! readable in cache dumps.

use sha2::{Digest, Sha256};

use crate::types::{ChannelParams, ParamValue};

/// Number of hex characters per dash-separated group.
const GROUP_LEN: usize = 8;

/// Computes the fingerprint of a request.
///
/// Parameters are hashed in key order, so two requests that differ only in
/// query-string ordering share a fingerprint.
///
/// # Examples
///
/// ```
/// use busline_core::hash::request_fingerprint;
/// use busline_core::types::ChannelParams;
///
/// let fp = request_fingerprint("GET", "/orders", &ChannelParams::new(), b"");
/// assert_eq!(fp.len(), 64 + 7);
/// assert_eq!(fp.split('-').count(), 8);
/// ```
#[must_use]
pub fn request_fingerprint(method: &str, path: &str, params: &ChannelParams, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, method.as_bytes());
    update_field(&mut hasher, path.as_bytes());
    hasher.update((params.len() as u64).to_le_bytes());
    for (key, value) in params {
        update_field(&mut hasher, key.as_bytes());
        match value {
            ParamValue::Single(v) => {
                hasher.update([0u8]);
                update_field(&mut hasher, v.as_bytes());
            }
            ParamValue::Multi(values) => {
                hasher.update([1u8]);
                hasher.update((values.len() as u64).to_le_bytes());
                for v in values {
                    update_field(&mut hasher, v.as_bytes());
                }
            }
        }
    }
    update_field(&mut hasher, body);
    group_hex(&hex::encode(hasher.finalize()))
}

/// Length-prefixed so that adjacent fields cannot run into each other.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Splits a hex digest into dash-separated groups.
#[must_use]
pub fn group_hex(digest: &str) -> String {
    digest
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Builds the response-cache key for a channel. The channel id namespaces
/// keys so that identical requests to different channels never collide.
#[must_use]
pub fn cache_key(channel_id: u64, hash: &str) -> String {
    format!("http-channel-{channel_id}-{hash}")
}

/// Generates a new correlation id: 24 lowercase hex characters.
#[must_use]
pub fn new_cid() -> String {
    let id = uuid::Uuid::new_v4();
    let mut out = hex::encode(id.as_bytes());
    out.truncate(24);
    out
}
