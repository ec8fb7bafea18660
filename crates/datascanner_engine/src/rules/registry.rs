//! Dispatch table for reading rules back from JSON.

use super::cpr::CprRule;
use super::dimensions::DimensionsRule;
use super::last_modified::LastModifiedRule;
use super::meta::{DummyRule, FallbackRule, HasConversionRule};
use super::regex::RegexRule;
use super::{Rule, Sensitivity, SimpleRule};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a simple rule from the properties of its JSON form.
pub type SimpleRuleFactory = fn(&Map<String, Value>) -> Result<Arc<dyn SimpleRule>>;

/// Labels the registry itself interprets.
const COMPOUND_LABELS: [&str; 3] = ["and", "or", "not"];

#[derive(Default)]
pub struct RuleRegistry {
    by_label: HashMap<String, SimpleRuleFactory>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in simple rule.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register("regex", |obj| Ok(Arc::new(RegexRule::from_json(obj)?)))?;
        registry.register("cpr", |obj| Ok(Arc::new(CprRule::from_json(obj)?)))?;
        registry.register("dimensions", |obj| Ok(Arc::new(DimensionsRule::from_json(obj)?)))?;
        registry.register("last-modified", |obj| Ok(Arc::new(LastModifiedRule::from_json(obj)?)))?;
        registry.register(HasConversionRule::TYPE_LABEL, |obj| {
            Ok(Arc::new(HasConversionRule::from_json(obj)?))
        })?;
        registry.register("fallback", |_| Ok(Arc::new(FallbackRule)))?;
        registry.register("dummy", |_| Ok(Arc::new(DummyRule)))?;
        Ok(registry)
    }

    pub fn register(&mut self, type_label: &str, factory: SimpleRuleFactory) -> Result<()> {
        if COMPOUND_LABELS.contains(&type_label) || self.by_label.contains_key(type_label) {
            return Err(EngineError::DuplicateRegistration {
                registry: "rule",
                key: type_label.to_string(),
            });
        }
        self.by_label.insert(type_label.to_string(), factory);
        Ok(())
    }

    pub fn from_json(&self, value: &Value) -> Result<Rule> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::malformed("rule", "expected a JSON object"))?;
        let label = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::malformed("rule", "missing 'type'"))?;

        let rule = match label {
            "and" => Rule::and(self.components(obj, label)?),
            "or" => Rule::or(self.components(obj, label)?),
            "not" => Rule::not(
                self.from_json(
                    obj.get("rule")
                        .ok_or_else(|| EngineError::malformed(label, "missing 'rule'"))?,
                )?,
            ),
            _ => {
                let factory = self
                    .by_label
                    .get(label)
                    .ok_or_else(|| EngineError::UnknownType(label.to_string()))?;
                Rule::from_kind(super::RuleKind::Simple(factory(obj)?))
            }
        };

        let rule = match Sensitivity::from_json(obj, label)? {
            Some(sensitivity) => rule.with_sensitivity(sensitivity),
            None => rule,
        };
        Ok(match obj.get("name").and_then(Value::as_str) {
            Some(name) => rule.with_name(name),
            None => rule,
        })
    }

    fn components(&self, obj: &Map<String, Value>, label: &str) -> Result<Vec<Rule>> {
        let components = obj
            .get("components")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::malformed(label, "missing 'components'"))?;
        if components.is_empty() {
            return Err(EngineError::malformed(label, "compound rule with no components"));
        }
        components.iter().map(|c| self.from_json(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let registry = RuleRegistry::builtin().unwrap();
        let value = json!({
            "type": "or",
            "components": [
                {"type": "cpr", "modulus_11": true, "ignore_irrelevant": false, "sensitivity": 1000},
                {"type": "and", "components": [
                    {"type": "dimensions", "width": [16, 16385], "height": [16, 16385], "minimum": 128},
                    {"type": "not", "rule": {"type": "last-modified", "after": "2020-01-01T00:00:00+0000"}}
                ]},
                {"type": "conversion", "target": "text", "name": "has text"},
                {"type": "fallback"},
                {"type": "dummy"}
            ]
        });
        let rule = registry.from_json(&value).unwrap();
        assert_eq!(rule.to_json_object(), value);
        assert_eq!(registry.from_json(&rule.to_json_object()).unwrap(), rule);
    }

    #[test]
    fn test_sensitivity_by_name() {
        let registry = RuleRegistry::builtin().unwrap();
        let rule = registry
            .from_json(&json!({"type": "regex", "expression": "x", "sensitivity": "warning"}))
            .unwrap();
        assert_eq!(rule.sensitivity(), Some(Sensitivity::Warning));
    }

    #[test]
    fn test_bad_rules() {
        let registry = RuleRegistry::builtin().unwrap();
        assert!(matches!(
            registry.from_json(&json!({"type": "telepathy"})),
            Err(EngineError::UnknownType(_))
        ));
        assert!(registry.from_json(&json!({"type": "and", "components": []})).unwrap_err().is_malformed());
        assert!(registry.from_json(&json!({"type": "regex"})).unwrap_err().is_malformed());
        assert!(registry
            .from_json(&json!({"type": "fallback", "sensitivity": 42}))
            .unwrap_err()
            .is_malformed());
    }

    #[test]
    fn test_compound_labels_are_reserved() {
        let mut registry = RuleRegistry::builtin().unwrap();
        assert!(registry.register("and", |_| Ok(Arc::new(DummyRule))).is_err());
        assert!(registry.register("regex", |_| Ok(Arc::new(DummyRule))).is_err());
    }
}
