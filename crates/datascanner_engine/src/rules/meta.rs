//! Rules about which conversions exist, rather than about content.

use super::SimpleRule;
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use serde_json::{json, Map, Value};

/// Asks for a conversion that never exists, so it never matches. Useful to
/// force complete exploration of a Source without doing any other work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DummyRule;

impl SimpleRule for DummyRule {
    fn type_label(&self) -> &'static str {
        "dummy"
    }

    fn operates_on(&self) -> OutputType {
        OutputType::Dummy
    }

    fn find_matches(&self, _: &OutputValue) -> Vec<Value> {
        Vec::new()
    }
}

/// Matches everything: the fallback conversion always succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackRule;

impl SimpleRule for FallbackRule {
    fn type_label(&self) -> &'static str {
        "fallback"
    }

    fn operates_on(&self) -> OutputType {
        OutputType::Fallback
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        match content {
            OutputValue::Fallback(true) => vec![json!({"match": true})],
            _ => Vec::new(),
        }
    }
}

/// Matches whenever the target conversion produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HasConversionRule {
    target: OutputType,
}

impl HasConversionRule {
    pub const TYPE_LABEL: &'static str = "conversion";

    pub fn new(target: OutputType) -> Self {
        Self { target }
    }

    pub(crate) fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let target = obj
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::malformed(Self::TYPE_LABEL, "missing 'target'"))?;
        Ok(Self::new(target.parse()?))
    }
}

impl SimpleRule for HasConversionRule {
    fn type_label(&self) -> &'static str {
        Self::TYPE_LABEL
    }

    fn operates_on(&self) -> OutputType {
        self.target
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        if content.output_type() == self.target {
            vec![json!({"match": self.target.as_str()})]
        } else {
            Vec::new()
        }
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("target".to_string(), Value::String(self.target.as_str().to_string()));
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_conversion() {
        let rule = HasConversionRule::new(OutputType::ImageDimensions);
        assert_eq!(
            rule.find_matches(&OutputValue::ImageDimensions(1, 1)),
            vec![json!({"match": "image-dimensions"})]
        );
        assert!(rule.find_matches(&OutputValue::Text(String::new())).is_empty());
        let parsed = HasConversionRule::from_json(json!({"target": "text"}).as_object().unwrap()).unwrap();
        assert_eq!(parsed.operates_on(), OutputType::Text);
    }

    #[test]
    fn test_fallback_and_dummy() {
        assert_eq!(FallbackRule.find_matches(&OutputValue::Fallback(true)).len(), 1);
        assert!(DummyRule.find_matches(&OutputValue::Fallback(true)).is_empty());
    }
}
