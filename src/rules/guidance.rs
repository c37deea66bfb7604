use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::model::RuleSet;
use crate::domain::{Advice, Confidence, Decision, Outcome, Truth};

/// Advice a rule set attaches to an outcome or to a rule result.
///
/// ```yaml
/// guidance:
///   eligible:
///     summary: Income is within the gross income limit
///     next_steps: [Apply through the local office]
///     documents_needed: [Photo ID]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guidance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents_needed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_impact_action: Option<String>,
}

impl Guidance {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.next_steps.is_empty()
            && self.documents_needed.is_empty()
            && self.high_impact_action.is_none()
    }

    /// Every text entry, for validation.
    pub(crate) fn texts(&self) -> impl Iterator<Item = &str> {
        self.summary
            .iter()
            .chain(self.next_steps.iter())
            .chain(self.documents_needed.iter())
            .chain(self.high_impact_action.iter())
            .map(String::as_str)
    }
}

/// Guidance of one rule, keyed by the rule's local result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGuidance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_true: Option<Guidance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_false: Option<Guidance>,
}

impl RuleGuidance {
    pub fn is_empty(&self) -> bool {
        self.when_true.is_none() && self.when_false.is_none()
    }

    pub fn for_result(&self, result: Truth) -> Option<&Guidance> {
        match result {
            Truth::True => self.when_true.as_ref(),
            Truth::False => self.when_false.as_ref(),
            Truth::Indeterminate => None,
        }
    }
}

/// Assemble the advice for `decision`.
///
/// Outcome guidance comes first, then rule guidance in reason order. Lists
/// keep the first occurrence of each entry. The first rule summary wins over
/// the outcome summary.
pub fn advise(rule_set: &RuleSet, decision: &Decision, confidence: Confidence) -> Advice {
    let by_rule: AHashMap<&str, &RuleGuidance> = rule_set
        .rules()
        .iter()
        .filter(|r| !r.guidance.is_empty())
        .map(|r| (r.id.as_str(), &r.guidance))
        .collect();

    let mut advice = Advice {
        confidence,
        ..Advice::default()
    };
    let mut rule_summary = None;

    if let Some(guidance) = rule_set.guidance(decision.outcome) {
        merge(&mut advice, guidance);
    }
    for reason in &decision.reasons {
        let Some(guidance) = by_rule
            .get(reason.rule.as_str())
            .and_then(|g| g.for_result(reason.result))
        else {
            continue;
        };
        if rule_summary.is_none() {
            rule_summary = guidance.summary.clone();
        }
        merge(&mut advice, guidance);
    }

    advice.summary = rule_summary.or_else(|| {
        rule_set
            .guidance(decision.outcome)
            .and_then(|g| g.summary.clone())
    });
    advice.reversible =
        decision.outcome == Outcome::Ineligible && !advice.high_impact_actions.is_empty();
    advice
}

fn merge(advice: &mut Advice, guidance: &Guidance) {
    push_unique(&mut advice.next_steps, &guidance.next_steps);
    push_unique(&mut advice.documents_needed, &guidance.documents_needed);
    push_unique(
        &mut advice.high_impact_actions,
        guidance.high_impact_action.as_slice(),
    );
}

fn push_unique(into: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}
