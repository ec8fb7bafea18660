//! Drivers for the split/convert/continue loop.

use super::{logical::Split, Continuation, Rule};
use crate::conversions::{OutputType, OutputValue};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What one evaluated simple rule found. `matches` is `None` when nothing
/// matched, including when the conversion it needed was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFragment {
    pub rule: Value,
    pub matches: Option<Vec<Value>>,
}

/// Result of evaluating a rule to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub matched: bool,
    pub fragments: Vec<MatchFragment>,
}

/// Runs the head of `split` and picks its continuation.
fn apply(split: Split, content: Option<&OutputValue>, fragments: &mut Vec<MatchFragment>) -> Continuation {
    let matches = split.run(content).filter(|found| !found.is_empty());
    fragments.push(MatchFragment {
        rule: split.head().to_json_object(),
        matches: matches.clone(),
    });
    split.advance(matches.is_some())
}

/// Evaluates as much of `rule` as the `available` representations allow.
///
/// `available` returns `None` for a type that has not been converted yet,
/// and `Some(None)` for one whose conversion produced nothing. Returns the
/// continuation reached (decided, or the rule still needing a conversion)
/// and the fragments of every head evaluated on the way.
pub fn run_available<F>(rule: Rule, available: F) -> Result<(Continuation, Vec<MatchFragment>)>
where
    F: Fn(OutputType) -> Option<Option<OutputValue>>,
{
    let mut fragments = Vec::new();
    let mut current = Continuation::Rule(rule);
    while let Continuation::Rule(rule) = &current {
        let split = rule.split()?;
        let Some(content) = available(split.operates_on()) else {
            break;
        };
        current = apply(split, content.as_ref(), &mut fragments);
    }
    Ok((current, fragments))
}

/// Evaluates `rule` to a verdict, asking `convert` for each representation
/// the rule's structure requires. Each output type is converted at most
/// once.
pub fn evaluate<F>(rule: &Rule, mut convert: F) -> Result<Evaluation>
where
    F: FnMut(OutputType) -> Result<Option<OutputValue>>,
{
    let mut converted: HashMap<OutputType, Option<OutputValue>> = HashMap::new();
    let mut fragments = Vec::new();
    let mut current = Continuation::Rule(rule.clone());
    loop {
        let split = match current {
            Continuation::Decided(matched) => return Ok(Evaluation { matched, fragments }),
            Continuation::Rule(ref rule) => rule.split()?,
        };
        let output = split.operates_on();
        if !converted.contains_key(&output) {
            let value = convert(output)?;
            converted.insert(output, value);
        }
        let content = converted.get(&output).and_then(Option::as_ref);
        current = apply(split, content, &mut fragments);
    }
}

#[cfg(test)]
mod tests {
    use super::super::meta::{DummyRule, FallbackRule};
    use super::super::regex::RegexRule;
    use super::*;
    use serde_json::json;

    fn regex(expression: &str) -> Rule {
        Rule::simple(RegexRule::new(expression).unwrap())
    }

    #[test]
    fn test_and_stops_at_first_failure() {
        let rule = Rule::and(vec![regex("dog"), regex("cat")]);
        let mut asked = Vec::new();
        let result = evaluate(&rule, |output| {
            asked.push(output);
            Ok(Some(OutputValue::Text("a cat".into())))
        })
        .unwrap();
        assert!(!result.matched);
        assert_eq!(asked, vec![OutputType::Text]);
        assert_eq!(result.fragments.len(), 1);
        assert_eq!(result.fragments[0].matches, None);
    }

    #[test]
    fn test_or_never_converts_unneeded_types() {
        let rule = Rule::or(vec![Rule::simple(FallbackRule), Rule::simple(DummyRule)]);
        let mut asked = Vec::new();
        let result = evaluate(&rule, |output| {
            asked.push(output);
            Ok(Some(OutputValue::Fallback(true)))
        })
        .unwrap();
        assert!(result.matched);
        assert_eq!(asked, vec![OutputType::Fallback]);
    }

    #[test]
    fn test_run_available_stops_at_missing_type() {
        let rule = Rule::and(vec![regex("cat"), Rule::simple(FallbackRule)]);
        let (next, fragments) = run_available(rule, |output| match output {
            OutputType::Text => Some(Some(OutputValue::Text("cat".into()))),
            _ => None,
        })
        .unwrap();
        assert_eq!(next, Continuation::Rule(Rule::simple(FallbackRule)));
        assert_eq!(
            fragments,
            vec![MatchFragment {
                rule: json!({"type": "regex", "expression": "cat"}),
                matches: Some(vec![json!({"offset": 0, "match": "cat"})]),
            }]
        );
    }

    #[test]
    fn test_failed_conversion_is_not_a_match() {
        let rule = Rule::not(regex("x"));
        let (next, fragments) = run_available(rule, |_| Some(None)).unwrap();
        assert_eq!(next, Continuation::Decided(true));
        assert_eq!(fragments[0].matches, None);
    }
}
