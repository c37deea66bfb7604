use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant (organization) identifier.
///
/// Every stored entity is keyed by an `OrgId` plus its own identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct OrgId(String);

impl OrgId {
    /// Create an organization id, trimming surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Self {
        OrgId(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for OrgId {
    fn from(id: String) -> Self {
        OrgId::new(id)
    }
}

impl From<OrgId> for String {
    fn from(id: OrgId) -> Self {
        id.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        RunId(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse from the hyphenated string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(RunId)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Published rule set version label (e.g. "2026-01-15.1").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RuleSetVersion(String);

impl RuleSetVersion {
    pub fn new(version: impl Into<String>) -> Self {
        RuleSetVersion(version.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for RuleSetVersion {
    fn from(version: String) -> Self {
        RuleSetVersion::new(version)
    }
}

impl From<RuleSetVersion> for String {
    fn from(version: RuleSetVersion) -> Self {
        version.0
    }
}

impl fmt::Display for RuleSetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who submitted a run (user id, service name, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Actor(name.into())
    }

    /// Actor used when the caller did not identify itself.
    pub fn anonymous() -> Self {
        Actor("anonymous".to_string())
    }

    /// Actor used for engine-initiated writes.
    pub fn system() -> Self {
        Actor("system".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deduplication key of a submission, lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_id_trims() {
        let org = OrgId::new("  acme ");
        assert_eq!(org.as_str(), "acme");
        assert!(!org.is_empty());
        assert!(OrgId::new("   ").is_empty());
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let parsed = RunId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(RunId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_fingerprint_short() {
        let fp = Fingerprint::new("0123456789abcdef0123");
        assert_eq!(fp.short(), "0123456789ab");
        assert_eq!(Fingerprint::new("abc").short(), "abc");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&OrgId::new("acme")).unwrap();
        assert_eq!(json, "\"acme\"");

        let version: RuleSetVersion = serde_json::from_str("\" v1 \"").unwrap();
        assert_eq!(version.as_str(), "v1");
    }
}
