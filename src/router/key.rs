//! Group key derivation.
//!
//! Plain keys read `persona_<name>` or `persona_<name>_<handle>`. They are
//! only used when that text alone identifies the pair: the name is
//! non-empty, has no `_`, and neither part was altered by sanitizing or
//! truncation. Every other pair gets a digest key, `persona__<hex>_...`,
//! which can never equal a plain key because a plain name never starts
//! with `_`.

use sha2::{Digest, Sha256};

/// Longest group key handed to the router
pub const MAX_GROUP_KEY_LEN: usize = 100;

const GROUP_PREFIX: &str = "persona_";

/// Hex characters of the pair digest in a digest key
const DIGEST_HEX_LEN: usize = 16;

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`
pub fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Canonical group key for a persona, optionally scoped to one user.
///
/// Distinct `(persona, handle)` pairs always get distinct keys. Output is
/// ASCII and never longer than [`MAX_GROUP_KEY_LEN`].
pub fn group_key(persona_name: &str, user_handle: Option<&str>) -> String {
    let persona = sanitize(persona_name);
    let handle = user_handle.map(sanitize);

    let mut plain = String::with_capacity(MAX_GROUP_KEY_LEN);
    plain.push_str(GROUP_PREFIX);
    plain.push_str(&persona);
    if let Some(ref handle) = handle {
        plain.push('_');
        plain.push_str(handle);
    }

    let unambiguous = !persona.is_empty()
        && persona == persona_name
        && !persona.contains('_')
        && user_handle.map_or(true, |raw| handle.as_deref() == Some(raw))
        && plain.len() <= MAX_GROUP_KEY_LEN;
    if unambiguous {
        return plain;
    }

    let mut key = String::with_capacity(MAX_GROUP_KEY_LEN);
    key.push_str(GROUP_PREFIX);
    key.push('_');
    key.push_str(&pair_digest(persona_name, user_handle));
    // Readable tail for logs; the digest already identifies the pair
    key.push('_');
    key.push_str(&plain[GROUP_PREFIX.len()..]);

    // Sanitized output is ASCII, so byte truncation lands on a char boundary
    key.truncate(MAX_GROUP_KEY_LEN);
    key
}

/// Digest of the raw pair, length-prefixed so the split point is fixed
fn pair_digest(persona_name: &str, user_handle: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update((persona_name.len() as u64).to_le_bytes());
    hasher.update(persona_name.as_bytes());
    match user_handle {
        Some(handle) => {
            hasher.update([1u8]);
            hasher.update(handle.as_bytes());
        }
        None => hasher.update([0u8]),
    }

    let digest = hasher.finalize();
    hex::encode(&digest[..DIGEST_HEX_LEN / 2])
}
