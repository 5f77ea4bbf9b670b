//! Content fingerprinting for duplicate detection.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Fingerprint;

/// Computes the fingerprint of a webhook from its route name and payload.
///
/// The digest covers the source name followed by the compact JSON encoding
/// of the payload. `serde_json` keeps object keys sorted, so the encoding is
/// canonical: payloads that compare equal hash equally regardless of the
/// key order they arrived in.
pub fn fingerprint(source: &str, payload: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}
