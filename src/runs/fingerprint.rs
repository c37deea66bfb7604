use sha2::{Digest, Sha256};

use crate::domain::{Facts, Fingerprint, OrgId, RuleSetVersion};

/// Domain separation tag; bump the suffix if the encoding ever changes.
const DOMAIN_TAG: &[u8] = b"eligr.fingerprint.v1";

/// Deduplication key of a submission.
///
/// Lowercase hex SHA-256 over:
///
/// ```text
/// "eligr.fingerprint.v1"
/// len(org) org
/// len(version) version
/// count(facts)
/// for each fact in key byte order: len(key) key len(value) value
/// ```
///
/// Lengths and the count are u64 little-endian. Values use the canonical,
/// kind-tagged form of [`FactValue::canonical`](crate::domain::FactValue::canonical),
/// so `70`, `70.0` and `70.00` agree while `70` and `"70"` do not.
pub fn fingerprint(org: &OrgId, version: &RuleSetVersion, facts: &Facts) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    put(&mut hasher, org.as_str().as_bytes());
    put(&mut hasher, version.as_str().as_bytes());
    hasher.update((facts.len() as u64).to_le_bytes());

    for (key, value) in facts.iter() {
        put(&mut hasher, key.as_bytes());
        put(&mut hasher, value.canonical().as_bytes());
    }

    Fingerprint::new(hex::encode(hasher.finalize()))
}

#[inline]
fn put(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Canonical facts as `key=value` lines, for logs and debugging.
pub fn canonical_facts(facts: &Facts) -> String {
    facts
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.canonical()))
        .collect::<Vec<_>>()
        .join("\n")
}
