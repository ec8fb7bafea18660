//! Simplifying constructors for compound rules, and splitting.

use super::{Continuation, Rule, RuleKind, SimpleRule};
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use serde_json::Value;
use std::sync::Arc;

/// Combines `components` with `&&` semantics: any literal `false` makes the
/// whole thing `false`, literal `true`s are dropped, and a single remaining
/// rule stands for itself.
pub fn make_and(components: Vec<Continuation>) -> Result<Continuation> {
    combine("and", components, false, Rule::and)
}

/// Combines `components` with `||` semantics, the mirror image of
/// [`make_and`].
pub fn make_or(components: Vec<Continuation>) -> Result<Continuation> {
    combine("or", components, true, Rule::or)
}

fn combine(
    label: &str,
    components: Vec<Continuation>,
    absorbing: bool,
    build: fn(Vec<Rule>) -> Rule,
) -> Result<Continuation> {
    if components.is_empty() {
        return Err(EngineError::malformed(label, "compound rule with no components"));
    }
    let mut rules = Vec::with_capacity(components.len());
    for component in components {
        match component {
            Continuation::Decided(outcome) if outcome == absorbing => return Ok(Continuation::Decided(absorbing)),
            Continuation::Decided(_) => {}
            Continuation::Rule(rule) => rules.push(rule),
        }
    }
    Ok(match rules.len() {
        // Every component was the identity element.
        0 => Continuation::Decided(!absorbing),
        1 => Continuation::Rule(rules.remove(0)),
        _ => Continuation::Rule(build(rules)),
    })
}

/// Negates `component`, inverting literals and cancelling double negation.
pub fn make_not(component: Continuation) -> Continuation {
    match component {
        Continuation::Decided(outcome) => Continuation::Decided(!outcome),
        Continuation::Rule(Rule {
            kind: RuleKind::Not(inner),
            ..
        }) => Continuation::Rule(*inner),
        Continuation::Rule(rule) => Continuation::Rule(Rule::not(rule)),
    }
}

/// `predicate ? then : otherwise`, expressed with the other constructors.
pub fn make_if(predicate: Continuation, then: Continuation, otherwise: Continuation) -> Result<Continuation> {
    let positive = make_and(vec![predicate.clone(), then])?;
    let negative = make_and(vec![make_not(predicate), otherwise])?;
    make_or(vec![positive, negative])
}

/// The next simple rule to evaluate, and where to go afterwards.
#[derive(Debug, Clone)]
pub struct Split {
    head: Rule,
    simple: Arc<dyn SimpleRule>,
    positive: Continuation,
    negative: Continuation,
}

impl Split {
    /// The simple rule to evaluate, with its sensitivity and name.
    pub fn head(&self) -> &Rule {
        &self.head
    }

    pub fn operates_on(&self) -> OutputType {
        self.simple.operates_on()
    }

    pub fn positive(&self) -> &Continuation {
        &self.positive
    }

    pub fn negative(&self) -> &Continuation {
        &self.negative
    }

    /// Runs the head against a converted value. `None` content, meaning no
    /// conversion was possible, gives `None`: the head cannot match.
    pub fn run(&self, content: Option<&OutputValue>) -> Option<Vec<Value>> {
        content.map(|value| self.simple.find_matches(value))
    }

    /// The continuation chosen by the head's outcome.
    pub fn advance(self, matched: bool) -> Continuation {
        if matched {
            self.positive
        } else {
            self.negative
        }
    }
}

impl Rule {
    /// Splits off the first simple rule. Compound rules split their first
    /// component and rebuild the rest around its continuations.
    pub fn split(&self) -> Result<Split> {
        match &self.kind {
            RuleKind::Simple(simple) => Ok(Split {
                head: self.clone(),
                simple: Arc::clone(simple),
                positive: Continuation::Decided(true),
                negative: Continuation::Decided(false),
            }),
            RuleKind::And(components) | RuleKind::Or(components) => {
                let make = if matches!(self.kind, RuleKind::And(_)) { make_and } else { make_or };
                let (first, rest) = components
                    .split_first()
                    .ok_or_else(|| EngineError::malformed(self.type_label(), "compound rule with no components"))?;
                let inner = first.split()?;
                let continue_with = |head: Continuation| {
                    let mut parts = Vec::with_capacity(components.len());
                    parts.push(head);
                    parts.extend(rest.iter().cloned().map(Continuation::Rule));
                    make(parts)
                };
                Ok(Split {
                    positive: continue_with(inner.positive)?,
                    negative: continue_with(inner.negative)?,
                    head: inner.head,
                    simple: inner.simple,
                })
            }
            RuleKind::Not(rule) => {
                let inner = rule.split()?;
                Ok(Split {
                    positive: make_not(inner.positive),
                    negative: make_not(inner.negative),
                    head: inner.head,
                    simple: inner.simple,
                })
            }
        }
    }
}
