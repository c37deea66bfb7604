use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::model::RuleSetDraft;
use crate::domain::OrgId;

/// Errors that can occur while reading rule set documents.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid document: {0}")]
    Document(String),
}

/// On-disk rule set: the owning organization plus the draft to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetDocument {
    pub org_id: OrgId,
    pub rule_set: RuleSetDraft,
}

/// Load one rule set document from a YAML file.
pub fn load_document(path: impl AsRef<Path>) -> Result<RuleSetDocument, LoadError> {
    let content = fs::read_to_string(path)?;
    let document: RuleSetDocument = serde_yaml::from_str(&content)?;

    if document.org_id.is_empty() {
        return Err(LoadError::Document("org_id cannot be empty".to_string()));
    }

    Ok(document)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Loads every `.yaml`/`.yml` document of a directory.
pub struct RuleSetLoader {
    dir: PathBuf,
}

impl RuleSetLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RuleSetLoader { dir: dir.into() }
    }

    /// Load all documents, sorted by file name.
    ///
    /// Each file gets its own result; one bad file does not hide the others.
    pub fn load_all(&self) -> Result<Vec<(PathBuf, Result<RuleSetDocument, LoadError>)>, LoadError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_yaml(p))
            .collect();
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| {
                let result = load_document(&path);
                (path, result)
            })
            .collect())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    const SNAP: &str = r#"
org_id: food-bank
rule_set:
  version: "2026.1"
  missing_facts: indeterminate
  facts:
    age: number
    household_size: number
    monthly_income: number
  rules:
    - id: income_under_limit
      description: Gross monthly income under the household limit
      when:
        check: { fact: monthly_income, lt: 2500 }
    - id: snap
      when:
        all:
          - rule: income_under_limit
          - check: { fact: household_size, gte: 1 }
  decision_rule: snap
"#;

    #[test]
    fn test_load_document() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", SNAP).unwrap();

        let doc = load_document(file.path()).unwrap();
        assert_eq!(doc.org_id.as_str(), "food-bank");
        assert_eq!(doc.rule_set.version.as_str(), "2026.1");
        assert_eq!(doc.rule_set.rules.len(), 2);
        assert_eq!(doc.rule_set.decision_rule.as_deref(), Some("snap"));
    }

    #[test]
    fn test_empty_org_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", SNAP.replace("org_id: food-bank", "org_id: \"  \"")).unwrap();

        let err = load_document(file.path()).unwrap_err();
        assert!(err.to_string().contains("org_id"));
    }

    #[test]
    fn test_load_all_keeps_going_past_bad_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.yaml"), SNAP).unwrap();
        fs::write(dir.path().join("a.yml"), "org_id: [unterminated").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = RuleSetLoader::new(dir.path());
        let results = loader.load_all().unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].0.ends_with("a.yml"));
        assert!(matches!(results[0].1, Err(LoadError::Yaml(_))));
        assert!(results[1].1.is_ok());
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let loader = RuleSetLoader::new("/nonexistent/eligr/rule-sets");
        assert!(matches!(loader.load_all(), Err(LoadError::Io(_))));
    }
}
