use ahash::AHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use super::guidance::advise;
use super::model::{Comparison, Expr, MissingFactPolicy, Rule, RuleSet};
use crate::domain::{Confidence, ConsultedFact, Decision, Facts, Outcome, Reason, Truth};

/// Errors raised while evaluating a rule set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("rule `{rule}` requires missing fact `{fact}`")]
    MissingFact { rule: String, fact: String },

    #[error("fact `{fact}` expects a {expected} value, got {found}")]
    TypeMismatch {
        fact: String,
        expected: &'static str,
        found: String,
    },

    #[error("rule `{rule}` has a literal that does not fit fact `{fact}`")]
    InvalidLiteral { rule: String, fact: String },

    #[error("unknown rule `{0}`")]
    UnknownRule(String),

    #[error("rule `{rule}` references undeclared fact `{fact}`")]
    UndeclaredFact { rule: String, fact: String },

    #[error("rule `{0}` is reached from itself")]
    Cycle(String),
}

type Consulted = SmallVec<[ConsultedFact; 2]>;

/// Evaluate `rule_set` against `facts`.
///
/// Pure: the result depends only on the rule set content and the facts.
/// Children are visited left to right, depth first; `all` stops at the
/// first false child and `any` at the first true one. A reason is recorded
/// for every rule visited, in the order rules are entered; rules visited
/// only for their guidance follow the decision's own reasons.
pub fn evaluate(rule_set: &RuleSet, facts: &Facts) -> Result<Decision, EvaluationError> {
    let mut evaluator = Evaluator::new(rule_set, facts);

    let root = match rule_set.decision_rule() {
        Some(id) => evaluator.rule(id)?,
        None => {
            let mut acc = Truth::True;
            for id in rule_set.root_rules() {
                acc = acc.and(evaluator.rule(id)?);
                if acc == Truth::False {
                    break;
                }
            }
            acc
        }
    };

    let outcome = Outcome::from(root);
    let confidence = Confidence::assess(outcome, &evaluator.reasons);

    // Rules carrying guidance are consulted even when the decision did not
    // reach them. Missing facts never fail this pass.
    evaluator.lenient = true;
    for rule in rule_set.rules() {
        if !rule.guidance.is_empty() {
            evaluator.rule(&rule.id)?;
        }
    }

    let mut decision = Decision::new(outcome, evaluator.reasons);
    decision.advice = advise(rule_set, &decision, confidence);
    Ok(decision)
}

struct Evaluator<'a> {
    rule_set: &'a RuleSet,
    facts: &'a Facts,
    index: AHashMap<&'a str, &'a Rule>,
    memo: AHashMap<&'a str, Truth>,
    active: Vec<&'a str>,
    reasons: Vec<Reason>,
    lenient: bool,
}

impl<'a> Evaluator<'a> {
    fn new(rule_set: &'a RuleSet, facts: &'a Facts) -> Self {
        let index = rule_set
            .rules()
            .iter()
            .map(|r| (r.id.as_str(), r))
            .collect();

        Evaluator {
            rule_set,
            facts,
            index,
            memo: AHashMap::new(),
            active: Vec::new(),
            reasons: Vec::with_capacity(rule_set.rules().len()),
            lenient: false,
        }
    }

    fn rule(&mut self, id: &'a str) -> Result<Truth, EvaluationError> {
        if let Some(result) = self.memo.get(id) {
            return Ok(*result);
        }
        if self.active.contains(&id) {
            return Err(EvaluationError::Cycle(id.to_string()));
        }
        let rule = *self
            .index
            .get(id)
            .ok_or_else(|| EvaluationError::UnknownRule(id.to_string()))?;

        // Reserve the slot now so reasons stay in entry order.
        let slot = self.reasons.len();
        self.reasons.push(Reason::new(id, Truth::Indeterminate));
        self.active.push(id);

        let mut consulted = Consulted::new();
        let result = self.expr(id, &rule.when, &mut consulted)?;

        self.active.pop();
        let reason = &mut self.reasons[slot];
        reason.facts = consulted;
        reason.result = result;
        self.memo.insert(id, result);

        Ok(result)
    }

    fn expr(
        &mut self,
        rule: &'a str,
        expr: &'a Expr,
        consulted: &mut Consulted,
    ) -> Result<Truth, EvaluationError> {
        match expr {
            Expr::All(children) => {
                let mut acc = Truth::True;
                for child in children {
                    acc = acc.and(self.expr(rule, child, consulted)?);
                    if acc == Truth::False {
                        break;
                    }
                }
                Ok(acc)
            }
            Expr::Any(children) => {
                let mut acc = Truth::False;
                for child in children {
                    acc = acc.or(self.expr(rule, child, consulted)?);
                    if acc == Truth::True {
                        break;
                    }
                }
                Ok(acc)
            }
            Expr::Not(inner) => Ok(!self.expr(rule, inner, consulted)?),
            Expr::Rule(id) => self.rule(id),
            Expr::Check(cmp) => self.check(rule, cmp, consulted),
        }
    }

    fn check(
        &self,
        rule: &str,
        cmp: &Comparison,
        consulted: &mut Consulted,
    ) -> Result<Truth, EvaluationError> {
        let ty = self
            .rule_set
            .fact_type(&cmp.fact)
            .ok_or_else(|| EvaluationError::UndeclaredFact {
                rule: rule.to_string(),
                fact: cmp.fact.clone(),
            })?;

        let value = self.facts.get(&cmp.fact);
        if !consulted.iter().any(|c| c.key == cmp.fact) {
            consulted.push(ConsultedFact {
                key: cmp.fact.clone(),
                value: value.cloned(),
            });
        }

        let Some(value) = value else {
            if self.lenient {
                return Ok(Truth::Indeterminate);
            }
            return match self.rule_set.missing_facts() {
                MissingFactPolicy::Indeterminate => Ok(Truth::Indeterminate),
                MissingFactPolicy::Strict => Err(EvaluationError::MissingFact {
                    rule: rule.to_string(),
                    fact: cmp.fact.clone(),
                }),
            };
        };

        let actual = ty
            .coerce(value)
            .ok_or_else(|| EvaluationError::TypeMismatch {
                fact: cmp.fact.clone(),
                expected: ty.name(),
                found: value.to_string(),
            })?;

        cmp.test
            .apply(ty, &actual)
            .map(Truth::from_bool)
            .ok_or_else(|| EvaluationError::InvalidLiteral {
                rule: rule.to_string(),
                fact: cmp.fact.clone(),
            })
    }
}
