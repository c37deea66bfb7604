use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::guidance::{Guidance, RuleGuidance};
use super::validate::ValidationError;
use crate::domain::{FactValue, Facts, OrgId, Outcome, RuleSetVersion};

/// Date facts and literals use ISO calendar dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared type of a fact key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Boolean,
    Number,
    String,
    Date,
    /// Closed set of symbols
    Enum(Vec<String>),
}

impl FactType {
    pub fn name(&self) -> &'static str {
        match self {
            FactType::Boolean => "boolean",
            FactType::Number => "number",
            FactType::String => "string",
            FactType::Date => "date",
            FactType::Enum(_) => "enum",
        }
    }

    /// Whether `test` is meaningful for this type.
    ///
    /// Ordering tests need an ordered domain; membership needs more than
    /// two values.
    pub fn supports(&self, test: &Test) -> bool {
        match self {
            FactType::Number | FactType::Date => true,
            FactType::Boolean => matches!(test, Test::Equals(_)),
            FactType::String | FactType::Enum(_) => matches!(test, Test::Equals(_) | Test::In(_)),
        }
    }

    /// Interpret a raw value under this type.
    pub(crate) fn coerce<'v>(&self, value: &'v FactValue) -> Option<Scalar<'v>> {
        match (self, value) {
            (FactType::Boolean, FactValue::Bool(b)) => Some(Scalar::Bool(*b)),
            (FactType::Number, FactValue::Number(n)) => Some(Scalar::Number(*n)),
            (FactType::String, FactValue::Text(s)) => Some(Scalar::Text(s)),
            (FactType::Enum(variants), FactValue::Text(s)) => variants
                .iter()
                .any(|v| v == s)
                .then_some(Scalar::Text(s)),
            (FactType::Date, FactValue::Text(s)) => NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .map(Scalar::Date),
            _ => None,
        }
    }
}

/// A typed value ready for comparison. Both sides of a comparison are
/// coerced through the same `FactType`, so variants never mix.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub(crate) enum Scalar<'a> {
    Bool(bool),
    Number(Decimal),
    Text(&'a str),
    Date(NaiveDate),
}

/// Behaviour when a consulted fact is absent. Rule sets must pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFactPolicy {
    /// The leaf is indeterminate and propagates unless short-circuited
    Indeterminate,
    /// Evaluation fails with a missing-fact error
    Strict,
}

impl MissingFactPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingFactPolicy::Indeterminate => "indeterminate",
            MissingFactPolicy::Strict => "strict",
        }
    }
}

/// Inclusive-by-default range bounds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<FactValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclusive_min: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclusive_max: bool,
}

impl Bounds {
    fn contains(&self, ty: &FactType, actual: &Scalar<'_>) -> Option<bool> {
        if let Some(min) = &self.min {
            let min = ty.coerce(min)?;
            let ok = if self.exclusive_min {
                *actual > min
            } else {
                *actual >= min
            };
            if !ok {
                return Some(false);
            }
        }
        if let Some(max) = &self.max {
            let max = ty.coerce(max)?;
            let ok = if self.exclusive_max {
                *actual < max
            } else {
                *actual <= max
            };
            if !ok {
                return Some(false);
            }
        }
        Some(true)
    }
}

/// Leaf test applied to a fact value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Test {
    Equals(FactValue),
    In(Vec<FactValue>),
    Range(Bounds),
    Gte(FactValue),
    Gt(FactValue),
    Lte(FactValue),
    Lt(FactValue),
}

impl Test {
    pub fn name(&self) -> &'static str {
        match self {
            Test::Equals(_) => "equals",
            Test::In(_) => "in",
            Test::Range(_) => "range",
            Test::Gte(_) => "gte",
            Test::Gt(_) => "gt",
            Test::Lte(_) => "lte",
            Test::Lt(_) => "lt",
        }
    }

    /// Literals carried by this test.
    pub fn literals(&self) -> Vec<&FactValue> {
        match self {
            Test::Equals(v) | Test::Gte(v) | Test::Gt(v) | Test::Lte(v) | Test::Lt(v) => vec![v],
            Test::In(values) => values.iter().collect(),
            Test::Range(b) => b.min.iter().chain(b.max.iter()).collect(),
        }
    }

    /// Apply the test. `None` when a literal does not coerce to `ty`.
    pub(crate) fn apply(&self, ty: &FactType, actual: &Scalar<'_>) -> Option<bool> {
        let result = match self {
            Test::Equals(v) => *actual == ty.coerce(v)?,
            Test::In(values) => {
                let mut hit = false;
                for v in values {
                    if *actual == ty.coerce(v)? {
                        hit = true;
                        break;
                    }
                }
                hit
            }
            Test::Range(bounds) => bounds.contains(ty, actual)?,
            Test::Gte(v) => *actual >= ty.coerce(v)?,
            Test::Gt(v) => *actual > ty.coerce(v)?,
            Test::Lte(v) => *actual <= ty.coerce(v)?,
            Test::Lt(v) => *actual < ty.coerce(v)?,
        };
        Some(result)
    }
}

/// Leaf comparison: `{fact: age, gte: 65}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub fact: String,
    #[serde(flatten)]
    pub test: Test,
}

/// Rule expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Not(Box<Expr>),
    /// Reference to another rule of the same set
    Rule(String),
    Check(Comparison),
}

impl Expr {
    /// Rule ids referenced anywhere in this expression, in traversal order.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::All(children) | Expr::Any(children) => {
                for child in children {
                    child.collect_references(out);
                }
            }
            Expr::Not(inner) => inner.collect_references(out),
            Expr::Rule(id) => out.push(id),
            Expr::Check(_) => {}
        }
    }
}

/// A named predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub when: Expr,
    /// Rules with guidance are consulted even when the decision does not need them
    #[serde(default, skip_serializing_if = "RuleGuidance::is_empty")]
    pub guidance: RuleGuidance,
}

/// Unvalidated rule set as submitted for publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetDraft {
    pub version: RuleSetVersion,
    pub missing_facts: MissingFactPolicy,
    #[serde(default)]
    pub facts: BTreeMap<String, FactType>,
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_rule: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub guidance: BTreeMap<Outcome, Guidance>,
}

/// Published, immutable rule set of one organization.
///
/// Only produced by [`validate`](super::validate::validate) or read back
/// from a store; there is no mutation API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    org_id: OrgId,
    version: RuleSetVersion,
    missing_facts: MissingFactPolicy,
    facts: BTreeMap<String, FactType>,
    rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decision_rule: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    guidance: BTreeMap<Outcome, Guidance>,
    content_hash: String,
    published_at: DateTime<Utc>,
}

impl RuleSet {
    pub(crate) fn from_draft(org_id: OrgId, draft: RuleSetDraft, content_hash: String) -> Self {
        RuleSet {
            org_id,
            version: draft.version,
            missing_facts: draft.missing_facts,
            facts: draft.facts,
            rules: draft.rules,
            decision_rule: draft.decision_rule,
            guidance: draft.guidance,
            content_hash,
            published_at: Utc::now(),
        }
    }

    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    pub fn version(&self) -> &RuleSetVersion {
        &self.version
    }

    pub fn missing_facts(&self) -> MissingFactPolicy {
        self.missing_facts
    }

    pub fn facts(&self) -> &BTreeMap<String, FactType> {
        &self.facts
    }

    pub fn fact_type(&self, key: &str) -> Option<&FactType> {
        self.facts.get(key)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Guidance declared for an outcome.
    pub fn guidance(&self, outcome: Outcome) -> Option<&Guidance> {
        self.guidance.get(&outcome)
    }

    pub fn decision_rule(&self) -> Option<&str> {
        self.decision_rule.as_deref()
    }

    /// SHA-256 of the draft content this set was published from.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Leading part of the content hash, for log lines.
    pub fn short_hash(&self) -> &str {
        self.content_hash.get(..12).unwrap_or(&self.content_hash)
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Rules not referenced by any other rule, in declaration order.
    ///
    /// Without an explicit decision rule, the decision is their conjunction.
    pub fn root_rules(&self) -> Vec<&str> {
        let referenced: BTreeSet<&str> = self
            .rules
            .iter()
            .flat_map(|r| r.when.references())
            .collect();

        self.rules
            .iter()
            .map(|r| r.id.as_str())
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    /// Reject submitted facts whose values do not fit their declared type.
    ///
    /// Undeclared keys are allowed; evaluation never consults them.
    pub fn check_facts(&self, facts: &Facts) -> Result<(), ValidationError> {
        for (key, value) in facts.iter() {
            if let Some(ty) = self.facts.get(key) {
                if ty.coerce(value).is_none() {
                    return Err(ValidationError::FactType {
                        fact: key.clone(),
                        expected: ty.name(),
                        found: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_tolerates_any_stored_hash() {
        let draft: RuleSetDraft = serde_yaml::from_str(
            "version: v1\nmissing_facts: strict\nfacts: { age: number }\nrules:\n  - { id: r, when: { check: { fact: age, gte: 1 } } }\n",
        )
        .unwrap();
        let published = crate::rules::validate(&OrgId::new("acme"), draft).unwrap();
        assert_eq!(published.short_hash(), &published.content_hash()[..12]);

        let mut body = serde_json::to_value(&published).unwrap();
        for tampered in ["abc", "", "aéééééé"] {
            body["content_hash"] = serde_json::Value::from(tampered);
            let stored: RuleSet = serde_json::from_value(body.clone()).unwrap();
            assert_eq!(stored.short_hash(), tampered);
        }
    }

    #[test]
    fn test_expr_yaml_shape() {
        let yaml = r#"
all:
  - check: { fact: age, gte: 65 }
  - not:
      check: { fact: status, in: [single, married] }
  - rule: income_ok
"#;
        let expr: Expr = serde_yaml::from_str(yaml).unwrap();

        match &expr {
            Expr::All(children) => {
                assert_eq!(children.len(), 3);
                assert_eq!(
                    children[0],
                    Expr::Check(Comparison {
                        fact: "age".to_string(),
                        test: Test::Gte(FactValue::from(65)),
                    })
                );
            }
            other => panic!("unexpected expression {:?}", other),
        }
        assert_eq!(expr.references(), vec!["income_ok"]);
    }

    #[test]
    fn test_range_yaml_shape() {
        let cmp: Comparison =
            serde_yaml::from_str("{ fact: income, range: { min: 0, max: 2000, exclusive_max: true } }")
                .unwrap();

        match cmp.test {
            Test::Range(bounds) => {
                assert_eq!(bounds.min, Some(FactValue::from(0)));
                assert!(bounds.exclusive_max);
                assert!(!bounds.exclusive_min);
            }
            other => panic!("unexpected test {:?}", other),
        }
    }

    #[test]
    fn test_fact_type_supports() {
        let eq = Test::Equals(FactValue::from(true));
        let member = Test::In(vec![FactValue::from("a")]);
        let range = Test::Range(Bounds::default());

        assert!(FactType::Boolean.supports(&eq));
        assert!(!FactType::Boolean.supports(&member));
        assert!(!FactType::String.supports(&range));
        assert!(FactType::Enum(vec!["a".into()]).supports(&member));
        assert!(FactType::Date.supports(&range));
        assert!(FactType::Number.supports(&Test::Gt(FactValue::from(1))));
    }

    #[test]
    fn test_coerce() {
        let status = FactType::Enum(vec!["single".into(), "married".into()]);
        assert!(status.coerce(&FactValue::from("single")).is_some());
        assert!(status.coerce(&FactValue::from("divorced")).is_none());

        assert_eq!(
            FactType::Date.coerce(&FactValue::from("2026-01-15")),
            NaiveDate::from_ymd_opt(2026, 1, 15).map(Scalar::Date)
        );
        assert!(FactType::Date.coerce(&FactValue::from("15/01/2026")).is_none());
        assert!(FactType::Number.coerce(&FactValue::from("70")).is_none());
    }

    #[test]
    fn test_apply_range_and_dates() {
        let bounds = Test::Range(Bounds {
            min: Some(FactValue::from("2020-01-01")),
            max: Some(FactValue::from("2020-12-31")),
            exclusive_min: false,
            exclusive_max: true,
        });
        let inside = FactValue::from("2020-06-01");
        let edge = FactValue::from("2020-12-31");

        let actual = FactType::Date.coerce(&inside).unwrap();
        assert_eq!(bounds.apply(&FactType::Date, &actual), Some(true));

        let actual = FactType::Date.coerce(&edge).unwrap();
        assert_eq!(bounds.apply(&FactType::Date, &actual), Some(false));
    }

    #[test]
    fn test_draft_requires_missing_fact_policy() {
        let yaml = r#"
version: v1
rules:
  - id: senior
    when: { check: { fact: age, gte: 65 } }
"#;
        let err = serde_yaml::from_str::<RuleSetDraft>(yaml).unwrap_err();
        assert!(err.to_string().contains("missing_facts"));
    }
}
