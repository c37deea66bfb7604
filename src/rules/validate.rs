use ahash::{AHashMap, AHashSet};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

use super::guidance::Guidance;
use super::model::{Bounds, Comparison, Expr, FactType, RuleSet, RuleSetDraft, Test};
use crate::domain::OrgId;

/// Deepest chain of combinators and rule references a published rule set
/// may contain. Evaluation recurses once per level.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Reasons a rule set draft (or a submission against it) is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("organization id cannot be empty")]
    EmptyOrganization,

    #[error("rule set version cannot be empty")]
    EmptyVersion,

    #[error("rule set has no rules")]
    NoRules,

    #[error("rule id cannot be empty")]
    EmptyRuleId,

    #[error("duplicate rule id: {0}")]
    DuplicateRule(String),

    #[error("enum fact `{0}` declares no variants")]
    EmptyEnum(String),

    #[error("rule `{rule}` references undeclared fact `{fact}`")]
    UndeclaredFact { rule: String, fact: String },

    #[error("rule `{rule}`: `{operator}` is not defined for {fact_type} fact `{fact}`")]
    OperatorMismatch {
        rule: String,
        fact: String,
        operator: &'static str,
        fact_type: &'static str,
    },

    #[error("rule `{rule}`: literal {literal} is not a valid {fact_type} for fact `{fact}`")]
    LiteralMismatch {
        rule: String,
        fact: String,
        literal: String,
        fact_type: &'static str,
    },

    #[error("rule `{rule}`: membership test on `{fact}` has no values")]
    EmptyMembership { rule: String, fact: String },

    #[error("rule `{rule}`: range on `{fact}` has no bounds")]
    UnboundedRange { rule: String, fact: String },

    #[error("rule `{rule}`: range on `{fact}` is empty (min above max)")]
    InvertedRange { rule: String, fact: String },

    #[error("rule `{rule}`: `{combinator}` needs at least one operand")]
    EmptyCombinator {
        rule: String,
        combinator: &'static str,
    },

    #[error("rule `{rule}` references unknown rule `{reference}`")]
    UnknownRule { rule: String, reference: String },

    #[error("decision rule `{0}` is not defined")]
    UnknownDecisionRule(String),

    #[error("cycle through rules: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("guidance for {0} has a blank entry")]
    BlankGuidance(String),

    #[error("rule `{rule}` nests deeper than {limit} levels")]
    TooDeep { rule: String, limit: usize },

    #[error("version {version} is already published with different content")]
    VersionConflict { version: String },

    #[error("fact `{fact}` expects a {expected} value, got {found}")]
    FactType {
        fact: String,
        expected: &'static str,
        found: String,
    },

    #[error("cannot encode rule set: {0}")]
    Encoding(String),
}

/// Validate a draft and produce the published rule set for `org_id`.
///
/// Checks run in a fixed order so the same draft always yields the same
/// first error.
pub fn validate(org_id: &OrgId, draft: RuleSetDraft) -> Result<RuleSet, ValidationError> {
    if org_id.is_empty() {
        return Err(ValidationError::EmptyOrganization);
    }
    if draft.version.is_empty() {
        return Err(ValidationError::EmptyVersion);
    }
    if draft.rules.is_empty() {
        return Err(ValidationError::NoRules);
    }

    for (key, ty) in &draft.facts {
        if let FactType::Enum(variants) = ty {
            if variants.is_empty() {
                return Err(ValidationError::EmptyEnum(key.clone()));
            }
        }
    }

    let mut ids = AHashSet::with_capacity(draft.rules.len());
    for rule in &draft.rules {
        if rule.id.trim().is_empty() {
            return Err(ValidationError::EmptyRuleId);
        }
        if !ids.insert(rule.id.as_str()) {
            return Err(ValidationError::DuplicateRule(rule.id.clone()));
        }
    }

    for rule in &draft.rules {
        check_expr(&rule.id, &rule.when, &draft.facts)?;
        for reference in rule.when.references() {
            if !ids.contains(reference) {
                return Err(ValidationError::UnknownRule {
                    rule: rule.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    if let Some(root) = &draft.decision_rule {
        if !ids.contains(root.as_str()) {
            return Err(ValidationError::UnknownDecisionRule(root.clone()));
        }
    }

    check_guidance(&draft)?;

    let order = order_rules(&draft).map_err(ValidationError::Cycle)?;
    nesting_depths(&draft, &order)?;

    let content_hash = content_hash(&draft)?;
    Ok(RuleSet::from_draft(org_id.clone(), draft, content_hash))
}

/// SHA-256 over the draft's JSON encoding. Map keys are ordered, so equal
/// drafts hash equally.
pub fn content_hash(draft: &RuleSetDraft) -> Result<String, ValidationError> {
    let bytes =
        serde_json::to_vec(draft).map_err(|e| ValidationError::Encoding(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn check_guidance(draft: &RuleSetDraft) -> Result<(), ValidationError> {
    let blank = |g: &Guidance| g.texts().any(|t| t.trim().is_empty());

    for (outcome, guidance) in &draft.guidance {
        if blank(guidance) {
            return Err(ValidationError::BlankGuidance(format!("outcome `{}`", outcome)));
        }
    }
    for rule in &draft.rules {
        let guidance = &rule.guidance;
        if guidance.when_true.iter().chain(guidance.when_false.iter()).any(blank) {
            return Err(ValidationError::BlankGuidance(format!("rule `{}`", rule.id)));
        }
    }
    Ok(())
}

fn check_expr(
    rule: &str,
    expr: &Expr,
    facts: &BTreeMap<String, FactType>,
) -> Result<(), ValidationError> {
    match expr {
        Expr::All(children) | Expr::Any(children) => {
            if children.is_empty() {
                return Err(ValidationError::EmptyCombinator {
                    rule: rule.to_string(),
                    combinator: if matches!(expr, Expr::All(_)) { "all" } else { "any" },
                });
            }
            for child in children {
                check_expr(rule, child, facts)?;
            }
            Ok(())
        }
        Expr::Not(inner) => check_expr(rule, inner, facts),
        Expr::Rule(_) => Ok(()),
        Expr::Check(cmp) => check_comparison(rule, cmp, facts),
    }
}

fn check_comparison(
    rule: &str,
    cmp: &Comparison,
    facts: &BTreeMap<String, FactType>,
) -> Result<(), ValidationError> {
    let ty = facts
        .get(&cmp.fact)
        .ok_or_else(|| ValidationError::UndeclaredFact {
            rule: rule.to_string(),
            fact: cmp.fact.clone(),
        })?;

    if !ty.supports(&cmp.test) {
        return Err(ValidationError::OperatorMismatch {
            rule: rule.to_string(),
            fact: cmp.fact.clone(),
            operator: cmp.test.name(),
            fact_type: ty.name(),
        });
    }

    for literal in cmp.test.literals() {
        if ty.coerce(literal).is_none() {
            return Err(ValidationError::LiteralMismatch {
                rule: rule.to_string(),
                fact: cmp.fact.clone(),
                literal: literal.to_string(),
                fact_type: ty.name(),
            });
        }
    }

    match &cmp.test {
        Test::In(values) if values.is_empty() => Err(ValidationError::EmptyMembership {
            rule: rule.to_string(),
            fact: cmp.fact.clone(),
        }),
        Test::Range(bounds) => check_bounds(rule, &cmp.fact, ty, bounds),
        _ => Ok(()),
    }
}

fn check_bounds(
    rule: &str,
    fact: &str,
    ty: &FactType,
    bounds: &Bounds,
) -> Result<(), ValidationError> {
    match (&bounds.min, &bounds.max) {
        (None, None) => Err(ValidationError::UnboundedRange {
            rule: rule.to_string(),
            fact: fact.to_string(),
        }),
        (Some(min), Some(max)) => {
            // Literals were coerced above.
            let (Some(lo), Some(hi)) = (ty.coerce(min), ty.coerce(max)) else {
                return Ok(());
            };
            let empty = lo > hi || (lo == hi && (bounds.exclusive_min || bounds.exclusive_max));
            if empty {
                Err(ValidationError::InvertedRange {
                    rule: rule.to_string(),
                    fact: fact.to_string(),
                })
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search over rule references, driven by an explicit stack.
///
/// Visits rules and references in declaration order. Returns the first
/// cycle found, or every rule ordered so that referenced rules come before
/// the rules that reference them.
fn order_rules(draft: &RuleSetDraft) -> Result<Vec<&str>, Vec<String>> {
    let edges: AHashMap<&str, Vec<&str>> = draft
        .rules
        .iter()
        .map(|r| (r.id.as_str(), r.when.references()))
        .collect();

    let mut marks: AHashMap<&str, Mark> = AHashMap::with_capacity(edges.len());
    let mut order = Vec::with_capacity(edges.len());
    // (rule, index of the next reference to follow)
    let mut stack: Vec<(&str, usize)> = Vec::new();

    for rule in &draft.rules {
        let root = rule.id.as_str();
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let refs = edges.get(node).map(Vec::as_slice).unwrap_or_default();
            let Some(&next) = refs.get(top.1) else {
                marks.insert(node, Mark::Done);
                order.push(node);
                stack.pop();
                continue;
            };
            top.1 += 1;

            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Err(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Visiting);
                    stack.push((next, 0));
                }
            }
        }
    }
    Ok(order)
}

/// Nesting depth of every rule, counting combinators, leaves and the
/// full depth of each referenced rule. `order` must list references first.
fn nesting_depths<'a>(
    draft: &'a RuleSetDraft,
    order: &[&'a str],
) -> Result<(), ValidationError> {
    let index: AHashMap<&str, &Expr> = draft
        .rules
        .iter()
        .map(|r| (r.id.as_str(), &r.when))
        .collect();

    let mut depths: AHashMap<&str, usize> = AHashMap::with_capacity(order.len());
    for &id in order {
        let Some(expr) = index.get(id) else { continue };
        let depth = expr_depth(expr, &depths);
        if depth > MAX_NESTING_DEPTH {
            return Err(ValidationError::TooDeep {
                rule: id.to_string(),
                limit: MAX_NESTING_DEPTH,
            });
        }
        depths.insert(id, depth);
    }
    Ok(())
}

fn expr_depth(expr: &Expr, depths: &AHashMap<&str, usize>) -> usize {
    match expr {
        Expr::All(children) | Expr::Any(children) => {
            1 + children.iter().map(|c| expr_depth(c, depths)).max().unwrap_or(0)
        }
        Expr::Not(inner) => 1 + expr_depth(inner, depths),
        Expr::Rule(id) => 1 + depths.get(id.as_str()).copied().unwrap_or(0),
        Expr::Check(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::MissingFactPolicy;

    fn draft(yaml: &str) -> RuleSetDraft {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn acme() -> OrgId {
        OrgId::new("acme")
    }

    const SENIOR: &str = r#"
version: v1
missing_facts: indeterminate
facts:
  age: number
rules:
  - id: senior
    when: { check: { fact: age, gte: 65 } }
"#;

    #[test]
    fn test_valid_draft_publishes() {
        let rule_set = validate(&acme(), draft(SENIOR)).unwrap();

        assert_eq!(rule_set.org_id(), &acme());
        assert_eq!(rule_set.version().as_str(), "v1");
        assert_eq!(rule_set.missing_facts(), MissingFactPolicy::Indeterminate);
        assert_eq!(rule_set.root_rules(), vec!["senior"]);
        assert_eq!(rule_set.content_hash().len(), 64);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = validate(&acme(), draft(SENIOR)).unwrap();
        let b = validate(&OrgId::new("other"), draft(SENIOR)).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let changed = draft(&SENIOR.replace("gte: 65", "gte: 66"));
        assert_ne!(content_hash(&changed).unwrap(), a.content_hash());
    }

    #[test]
    fn test_undeclared_fact() {
        let err = validate(&acme(), draft(&SENIOR.replace("fact: age,", "fact: income,")))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UndeclaredFact {
                rule: "senior".to_string(),
                fact: "income".to_string(),
            }
        );
    }

    #[test]
    fn test_membership_on_boolean_rejected() {
        let err = validate(
            &acme(),
            draft(
                r#"
version: v1
missing_facts: strict
facts:
  veteran: boolean
rules:
  - id: vet
    when: { check: { fact: veteran, in: [true] } }
"#,
            ),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ValidationError::OperatorMismatch { operator: "in", fact_type: "boolean", .. }
        ));
    }

    #[test]
    fn test_literal_outside_enum() {
        let err = validate(
            &acme(),
            draft(
                r#"
version: v1
missing_facts: strict
facts:
  household: { enum: [single, married] }
rules:
  - id: h
    when: { check: { fact: household, equals: divorced } }
"#,
            ),
        )
        .unwrap_err();

        assert!(matches!(err, ValidationError::LiteralMismatch { .. }));
    }

    #[test]
    fn test_range_checks() {
        let base = r#"
version: v1
missing_facts: strict
facts:
  income: number
rules:
  - id: r
    when: { check: { fact: income, range: RANGE } }
"#;
        let unbounded = draft(&base.replace("RANGE", "{}"));
        assert!(matches!(
            validate(&acme(), unbounded),
            Err(ValidationError::UnboundedRange { .. })
        ));

        let inverted = draft(&base.replace("RANGE", "{ min: 10, max: 5 }"));
        assert!(matches!(
            validate(&acme(), inverted),
            Err(ValidationError::InvertedRange { .. })
        ));

        let ok = draft(&base.replace("RANGE", "{ min: 5, max: 5 }"));
        assert!(validate(&acme(), ok).is_ok());
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = validate(
            &acme(),
            draft(
                r#"
version: v1
missing_facts: indeterminate
facts:
  age: number
rules:
  - id: a
    when: { all: [ { rule: b }, { check: { fact: age, gte: 1 } } ] }
  - id: b
    when: { any: [ { rule: c } ] }
  - id: c
    when: { not: { rule: a } }
"#,
            ),
        )
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::Cycle(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "a".to_string()
            ])
        );
        assert_eq!(err.to_string(), "cycle through rules: a -> b -> c -> a");
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = validate(
            &acme(),
            draft(
                r#"
version: v1
missing_facts: indeterminate
rules:
  - id: loop
    when: { rule: loop }
"#,
            ),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle(vec!["loop".to_string(), "loop".to_string()])
        );
    }

    #[test]
    fn test_shared_rule_is_not_a_cycle() {
        let rule_set = validate(
            &acme(),
            draft(
                r#"
version: v1
missing_facts: indeterminate
facts:
  age: number
rules:
  - id: adult
    when: { check: { fact: age, gte: 18 } }
  - id: left
    when: { rule: adult }
  - id: right
    when: { rule: adult }
"#,
            ),
        )
        .unwrap();
        assert_eq!(rule_set.root_rules(), vec!["left", "right"]);
    }

    /// `r0 -> r1 -> ... -> r{len-1}`; the last rule checks `age` or, with
    /// `close`, points back at `r0`.
    fn chain(len: usize, close: bool) -> RuleSetDraft {
        let rules: Vec<serde_json::Value> = (0..len)
            .map(|i| {
                let when = if i + 1 < len {
                    serde_json::json!({ "rule": format!("r{}", i + 1) })
                } else if close {
                    serde_json::json!({ "rule": "r0" })
                } else {
                    serde_json::json!({ "check": { "fact": "age", "gte": 1 } })
                };
                serde_json::json!({ "id": format!("r{}", i), "when": when })
            })
            .collect();

        serde_json::from_value(serde_json::json!({
            "version": "v1",
            "missing_facts": "indeterminate",
            "facts": { "age": "number" },
            "rules": rules,
        }))
        .unwrap()
    }

    fn validate_on_small_stack(draft: RuleSetDraft) -> Result<RuleSet, ValidationError> {
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || validate(&OrgId::new("acme"), draft))
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn test_long_reference_chain_rejected() {
        let err = validate_on_small_stack(chain(20_000, false)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooDeep {
                rule: format!("r{}", 20_000 - MAX_NESTING_DEPTH - 1),
                limit: MAX_NESTING_DEPTH,
            }
        );
    }

    #[test]
    fn test_long_cycle_found_without_recursion() {
        let err = validate_on_small_stack(chain(20_000, true)).unwrap_err();
        let ValidationError::Cycle(path) = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(path.len(), 20_001);
        assert_eq!(path.first().map(String::as_str), Some("r0"));
        assert_eq!(path.last().map(String::as_str), Some("r0"));
    }

    #[test]
    fn test_chain_at_depth_limit_publishes() {
        assert!(validate(&acme(), chain(MAX_NESTING_DEPTH, false)).is_ok());
        assert!(matches!(
            validate(&acme(), chain(MAX_NESTING_DEPTH + 1, false)),
            Err(ValidationError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_blank_guidance_rejected() {
        let with_outcome = format!("{SENIOR}guidance:\n  eligible:\n    next_steps: [\"  \"]\n");
        assert_eq!(
            validate(&acme(), draft(&with_outcome)),
            Err(ValidationError::BlankGuidance("outcome `eligible`".to_string()))
        );

        let with_rule = SENIOR.replace(
            "    when: { check: { fact: age, gte: 65 } }\n",
            "    when: { check: { fact: age, gte: 65 } }\n    guidance: { when_false: { summary: \"\" } }\n",
        );
        assert_eq!(
            validate(&acme(), draft(&with_rule)),
            Err(ValidationError::BlankGuidance("rule `senior`".to_string()))
        );
    }

    #[test]
    fn test_guidance_does_not_change_plain_hash() {
        let plain = validate(&acme(), draft(SENIOR)).unwrap();
        let guided = format!("{SENIOR}guidance:\n  eligible:\n    summary: Apply now\n");
        let guided = validate(&acme(), draft(&guided)).unwrap();

        assert_eq!(content_hash(&draft(SENIOR)).unwrap(), plain.content_hash());
        assert_ne!(guided.content_hash(), plain.content_hash());
        assert_eq!(
            guided.guidance(crate::domain::Outcome::Eligible).and_then(|g| g.summary.as_deref()),
            Some("Apply now")
        );
    }

    #[test]
    fn test_structural_errors() {
        let dup = draft(
            r#"
version: v1
missing_facts: strict
facts: { age: number }
rules:
  - { id: a, when: { check: { fact: age, gt: 1 } } }
  - { id: a, when: { check: { fact: age, lt: 1 } } }
"#,
        );
        assert_eq!(
            validate(&acme(), dup),
            Err(ValidationError::DuplicateRule("a".to_string()))
        );

        let unknown = draft(&SENIOR.replace("{ check: { fact: age, gte: 65 } }", "{ rule: nope }"));
        assert!(matches!(
            validate(&acme(), unknown),
            Err(ValidationError::UnknownRule { .. })
        ));

        let empty_all = draft(&SENIOR.replace("{ check: { fact: age, gte: 65 } }", "{ all: [] }"));
        assert!(matches!(
            validate(&acme(), empty_all),
            Err(ValidationError::EmptyCombinator { combinator: "all", .. })
        ));

        let mut no_version = draft(SENIOR);
        no_version.version = crate::domain::RuleSetVersion::new(" ");
        assert_eq!(validate(&acme(), no_version), Err(ValidationError::EmptyVersion));

        assert_eq!(
            validate(&OrgId::new(""), draft(SENIOR)),
            Err(ValidationError::EmptyOrganization)
        );
    }
}
