//! Modification-time filtering.

use super::SimpleRule;
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

pub const TYPE_LABEL: &str = "last-modified";

/// Matches content modified strictly after a cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastModifiedRule {
    after: DateTime<Utc>,
}

impl LastModifiedRule {
    pub fn new(after: DateTime<Utc>) -> Self {
        Self { after }
    }

    fn encode(when: DateTime<Utc>) -> Value {
        OutputValue::LastModified(when)
            .to_json()
            .unwrap_or(Value::Null)
    }

    pub(crate) fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let after = obj
            .get("after")
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "missing 'after'"))?;
        match OutputType::LastModified.decode(after)? {
            Some(OutputValue::LastModified(when)) => Ok(Self::new(when)),
            _ => Err(EngineError::malformed(TYPE_LABEL, "'after' must be a timestamp")),
        }
    }
}

impl SimpleRule for LastModifiedRule {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn operates_on(&self) -> OutputType {
        OutputType::LastModified
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        match content {
            OutputValue::LastModified(when) if *when > self.after => vec![json!({"match": Self::encode(*when)})],
            _ => Vec::new(),
        }
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("after".to_string(), Self::encode(self.after));
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_strictly_after() {
        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let rule = LastModifiedRule::new(cutoff);
        assert!(rule.find_matches(&OutputValue::LastModified(cutoff)).is_empty());
        let later = Utc.with_ymd_and_hms(2020, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(
            rule.find_matches(&OutputValue::LastModified(later)),
            vec![json!({"match": "2020-06-01T08:00:00+0000"})]
        );
    }

    #[test]
    fn test_json_form() {
        let obj = json!({"after": "2021-03-04T05:06:07+0100"});
        let rule = LastModifiedRule::from_json(obj.as_object().unwrap()).unwrap();
        assert_eq!(rule.properties()["after"], "2021-03-04T04:06:07+0000");
        assert!(LastModifiedRule::from_json(json!({"after": 7}).as_object().unwrap()).is_err());
    }
}
