//! Regular-expression matching over text.

use super::SimpleRule;
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use ::regex::Regex;
use serde_json::{json, Map, Value};
use std::fmt;

pub const TYPE_LABEL: &str = "regex";

/// Character offset of a byte offset into `text`.
pub(crate) fn char_offset(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset].chars().count()
}

#[derive(Clone)]
pub struct RegexRule {
    expression: String,
    compiled: Regex,
}

impl RegexRule {
    pub fn new(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        let compiled = Regex::new(&expression)
            .map_err(|e| EngineError::malformed(TYPE_LABEL, format!("bad expression: {}", e)))?;
        Ok(Self { expression, compiled })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub(crate) fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let expression = obj
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "missing 'expression'"))?;
        Self::new(expression)
    }
}

impl fmt::Debug for RegexRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegexRule").field(&self.expression).finish()
    }
}

impl SimpleRule for RegexRule {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn operates_on(&self) -> OutputType {
        OutputType::Text
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        let OutputValue::Text(text) = content else {
            return Vec::new();
        };
        self.compiled
            .find_iter(text)
            .map(|m| {
                json!({
                    "offset": char_offset(text, m.start()),
                    "match": m.as_str(),
                })
            })
            .collect()
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("expression".to_string(), Value::String(self.expression.clone()));
        props
    }
}
