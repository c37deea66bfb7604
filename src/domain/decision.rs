use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use super::facts::FactValue;

/// Three-valued truth used while evaluating rule expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truth {
    True,
    False,
    Indeterminate,
}

impl Truth {
    #[inline]
    pub fn from_bool(value: bool) -> Self {
        if value {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// Kleene conjunction.
    #[inline]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Indeterminate,
        }
    }

    /// Kleene disjunction.
    #[inline]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Indeterminate,
        }
    }

    #[inline]
    pub fn is_determined(&self) -> bool {
        !matches!(self, Truth::Indeterminate)
    }
}

/// Negation; indeterminate stays indeterminate.
impl std::ops::Not for Truth {
    type Output = Truth;

    #[inline]
    fn not(self) -> Self::Output {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Indeterminate => Truth::Indeterminate,
        }
    }
}

impl fmt::Display for Truth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Truth::True => write!(f, "true"),
            Truth::False => write!(f, "false"),
            Truth::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Eligibility outcome category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Eligible,
    Ineligible,
    Indeterminate,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Eligible => "eligible",
            Outcome::Ineligible => "ineligible",
            Outcome::Indeterminate => "indeterminate",
        }
    }

    /// Parse from string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "eligible" => Some(Outcome::Eligible),
            "ineligible" => Some(Outcome::Ineligible),
            "indeterminate" => Some(Outcome::Indeterminate),
            _ => None,
        }
    }
}

impl From<Truth> for Outcome {
    fn from(root: Truth) -> Self {
        match root {
            Truth::True => Outcome::Eligible,
            Truth::False => Outcome::Ineligible,
            Truth::Indeterminate => Outcome::Indeterminate,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fact read while evaluating a rule. `value` is `None` when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultedFact {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FactValue>,
}

/// Why a rule produced its local result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// The rule that was visited
    pub rule: String,

    /// Facts consulted by the rule's own comparisons, in consultation order
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub facts: SmallVec<[ConsultedFact; 2]>,

    /// The rule's local result
    pub result: Truth,
}

impl Reason {
    pub fn new(rule: impl Into<String>, result: Truth) -> Self {
        Reason {
            rule: rule.into(),
            facts: SmallVec::new(),
            result,
        }
    }
}

/// How completely the submitted facts backed an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Every fact the decision consulted was provided
    #[default]
    High,
    /// Determined, but some consulted facts were missing
    Medium,
    /// No outcome could be determined
    Low,
}

impl Confidence {
    pub fn assess(outcome: Outcome, reasons: &[Reason]) -> Self {
        if outcome == Outcome::Indeterminate {
            return Confidence::Low;
        }
        let gaps = reasons
            .iter()
            .flat_map(|r| r.facts.iter())
            .any(|f| f.value.is_none());
        if gaps {
            Confidence::Medium
        } else {
            Confidence::High
        }
    }
}

/// Applicant-facing advice assembled from the rule set's guidance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents_needed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub high_impact_actions: Vec<String>,
    /// A negative outcome that a high-impact action could turn around
    #[serde(default)]
    pub reversible: bool,
    #[serde(default)]
    pub confidence: Confidence,
}

/// Evaluator output: outcome plus reasons in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub reasons: Vec<Reason>,
    #[serde(default)]
    pub advice: Advice,
}

impl Decision {
    pub fn new(outcome: Outcome, reasons: Vec<Reason>) -> Self {
        let advice = Advice {
            confidence: Confidence::assess(outcome, &reasons),
            ..Advice::default()
        };
        Decision {
            outcome,
            reasons,
            advice,
        }
    }

    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.outcome == Outcome::Eligible
    }

    /// Reason recorded for a rule, if it was visited.
    pub fn reason(&self, rule: &str) -> Option<&Reason> {
        self.reasons.iter().find(|r| r.rule == rule)
    }

    /// Rules whose local result was true.
    pub fn matched(&self) -> impl Iterator<Item = &Reason> {
        self.reasons.iter().filter(|r| r.result == Truth::True)
    }

    /// Rules whose local result was false.
    pub fn failed(&self) -> impl Iterator<Item = &Reason> {
        self.reasons.iter().filter(|r| r.result == Truth::False)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_reflects_missing_facts() {
        let mut partial = Reason::new("income", Truth::False);
        partial.facts.push(ConsultedFact {
            key: "income".to_string(),
            value: None,
        });
        let complete = Reason::new("age", Truth::True);

        assert_eq!(Confidence::assess(Outcome::Eligible, &[complete.clone()]), Confidence::High);
        assert_eq!(
            Confidence::assess(Outcome::Ineligible, &[complete, partial.clone()]),
            Confidence::Medium
        );
        assert_eq!(Confidence::assess(Outcome::Indeterminate, &[partial]), Confidence::Low);
    }

    #[test]
    fn test_decision_without_advice_deserializes() {
        let decision: Decision =
            serde_json::from_str(r#"{"outcome":"eligible","reasons":[]}"#).unwrap();
        assert_eq!(decision.advice, Advice::default());
    }

    #[test]
    fn test_kleene_and() {
        use Truth::*;
        assert_eq!(True.and(True), True);
        assert_eq!(True.and(False), False);
        assert_eq!(Indeterminate.and(False), False);
        assert_eq!(Indeterminate.and(True), Indeterminate);
        assert_eq!(Indeterminate.and(Indeterminate), Indeterminate);
    }

    #[test]
    fn test_kleene_or_and_not() {
        use Truth::*;
        assert_eq!(False.or(False), False);
        assert_eq!(Indeterminate.or(True), True);
        assert_eq!(Indeterminate.or(False), Indeterminate);
        assert_eq!(!Indeterminate, Indeterminate);
        assert_eq!(!True, False);
    }

    #[test]
    fn test_outcome_from_root() {
        assert_eq!(Outcome::from(Truth::True), Outcome::Eligible);
        assert_eq!(Outcome::from(Truth::False), Outcome::Ineligible);
        assert_eq!(Outcome::from(Truth::Indeterminate), Outcome::Indeterminate);
        assert_eq!(Outcome::from_str("ELIGIBLE"), Some(Outcome::Eligible));
        assert_eq!(Outcome::from_str("maybe"), None);
    }

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::new(
            Outcome::Eligible,
            vec![Reason::new("age>=65", Truth::True)],
        );

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "outcome": "eligible",
                "reasons": [{"rule": "age>=65", "result": "true"}],
                "advice": {"reversible": false, "confidence": "high"}
            })
        );
    }

    #[test]
    fn test_matched_and_failed() {
        let decision = Decision::new(
            Outcome::Ineligible,
            vec![
                Reason::new("income", Truth::True),
                Reason::new("residency", Truth::False),
                Reason::new("age", Truth::Indeterminate),
            ],
        );

        assert_eq!(decision.matched().count(), 1);
        assert_eq!(decision.failed().next().unwrap().rule, "residency");
        assert!(decision.reason("age").is_some());
        assert!(!decision.is_eligible());
    }
}
