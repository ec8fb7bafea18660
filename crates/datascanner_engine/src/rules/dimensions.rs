//! Image size filtering.

use super::SimpleRule;
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use serde_json::{json, Map, Value};
use std::ops::Range;

pub const TYPE_LABEL: &str = "dimensions";

const DEFAULT_RANGE: Range<u32> = 16..16385;
const DEFAULT_MINIMUM: u32 = 128;

/// Matches images whose width and height both fall in (half-open) ranges
/// and whose larger side is at least `minimum` pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionsRule {
    width: Range<u32>,
    height: Range<u32>,
    minimum: u32,
}

impl Default for DimensionsRule {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE, DEFAULT_RANGE, DEFAULT_MINIMUM)
    }
}

impl DimensionsRule {
    pub fn new(width: Range<u32>, height: Range<u32>, minimum: u32) -> Self {
        Self { width, height, minimum }
    }

    fn range(obj: &Map<String, Value>, key: &str) -> Result<Range<u32>> {
        match obj.get(key) {
            None => Ok(DEFAULT_RANGE),
            Some(value) => {
                let (start, stop): (u32, u32) = serde_json::from_value(value.clone())
                    .map_err(|_| EngineError::malformed(TYPE_LABEL, format!("'{}' must be [start, stop]", key)))?;
                Ok(start..stop)
            }
        }
    }

    pub(crate) fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let minimum = match obj.get("minimum") {
            None => DEFAULT_MINIMUM,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "'minimum' must be a number"))?,
        };
        Ok(Self::new(Self::range(obj, "width")?, Self::range(obj, "height")?, minimum))
    }
}

impl SimpleRule for DimensionsRule {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn operates_on(&self) -> OutputType {
        OutputType::ImageDimensions
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        let &OutputValue::ImageDimensions(w, h) = content else {
            return Vec::new();
        };
        if self.width.contains(&w) && self.height.contains(&h) && w.max(h) >= self.minimum {
            vec![json!({"match": [w, h]})]
        } else {
            Vec::new()
        }
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("width".to_string(), json!([self.width.start, self.width.end]));
        props.insert("height".to_string(), json!([self.height.start, self.height.end]));
        props.insert("minimum".to_string(), json!(self.minimum));
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(rule: &DimensionsRule, w: u32, h: u32) -> bool {
        !rule.find_matches(&OutputValue::ImageDimensions(w, h)).is_empty()
    }

    #[test]
    fn test_default_bounds() {
        let rule = DimensionsRule::default();
        assert!(check(&rule, 128, 16));
        assert!(!check(&rule, 127, 127));
        assert!(!check(&rule, 15, 400));
        assert!(check(&rule, 16384, 200));
        assert!(!check(&rule, 16385, 200));
        assert_eq!(
            rule.find_matches(&OutputValue::ImageDimensions(640, 480)),
            vec![json!({"match": [640, 480]})]
        );
    }

    #[test]
    fn test_json_defaults_and_bounds() {
        let obj = json!({"width": [100, 200], "minimum": 150});
        let rule = DimensionsRule::from_json(obj.as_object().unwrap()).unwrap();
        assert_eq!(rule, DimensionsRule::new(100..200, DEFAULT_RANGE, 150));
        assert!(DimensionsRule::from_json(json!({"width": "wide"}).as_object().unwrap()).is_err());
    }
}
