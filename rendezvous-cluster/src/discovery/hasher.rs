//! Endpoint identity hashing
//!
//! The digest is SHA-1 in lowercase hex. Every process computes the same value
//! for the same endpoint, so a hash can be handed to another node and resolved
//! back to an endpoint there.

use sha1::{Digest, Sha1};

/// Number of hex digits used when measuring distance between two hashes
const DISTANCE_PREFIX_LEN: usize = 16;

/// Hash an endpoint address into its stable identity
#[must_use]
pub fn hash_endpoint(endpoint: &str) -> String {
    hex::encode(Sha1::digest(endpoint.as_bytes()))
}

/// XOR distance between the leading 64 bits of two hashes.
///
/// Inputs are expected to be `hash_endpoint` digests. Symmetric, and zero only
/// for hashes sharing the prefix. Inputs that do not start with 16 hex digits
/// are hashed first so any caller token still maps to a point.
#[must_use]
pub fn hash_distance(a: &str, b: &str) -> u64 {
    hash_prefix(a) ^ hash_prefix(b)
}

fn hash_prefix(hash: &str) -> u64 {
    hash.get(..DISTANCE_PREFIX_LEN)
        .filter(|prefix| prefix.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .unwrap_or_else(|| {
            let digest = hash_endpoint(hash);
            u64::from_str_radix(&digest[..DISTANCE_PREFIX_LEN], 16).unwrap_or_default()
        })
}
