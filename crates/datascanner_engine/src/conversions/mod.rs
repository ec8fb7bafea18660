//! Typed conversions of Resource content.
//!
//! A [`ConversionRegistry`] maps `(OutputType, MIME type)` to a function
//! that derives a typed value from a Resource. Lookup tries the exact MIME
//! type first and then the wildcard entry for the output type.

mod basic;
mod image;
mod text;

use crate::error::{EngineError, Result};
use crate::model::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

pub use self::text::html_to_text;

/// Format of encoded timestamps.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

// ============================================================================
// Output types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    Text,
    LastModified,
    ImageDimensions,
    /// Always converts, to `true`.
    Fallback,
    /// Never converts.
    Dummy,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Text => "text",
            OutputType::LastModified => "last-modified",
            OutputType::ImageDimensions => "image-dimensions",
            OutputType::Fallback => "fallback",
            OutputType::Dummy => "dummy",
        }
    }

    /// JSON form of a value of this type.
    pub fn encode(&self, value: &OutputValue) -> Result<Value> {
        match (self, value) {
            (OutputType::Text, OutputValue::Text(text)) => Ok(Value::String(text.clone())),
            (OutputType::LastModified, OutputValue::LastModified(when)) => {
                Ok(Value::String(when.format(DATE_FORMAT).to_string()))
            }
            (OutputType::ImageDimensions, OutputValue::ImageDimensions(w, h)) => Ok(serde_json::json!([w, h])),
            (OutputType::Fallback, OutputValue::Fallback(flag)) => Ok(Value::Bool(*flag)),
            _ => Err(EngineError::malformed(
                self.as_str(),
                format!("cannot encode a {} value", value.output_type()),
            )),
        }
    }

    /// Reads a value of this type back from JSON. `null` means the
    /// conversion produced nothing.
    pub fn decode(&self, value: &Value) -> Result<Option<OutputValue>> {
        if value.is_null() {
            return Ok(None);
        }
        let bad = || EngineError::malformed(self.as_str(), format!("unexpected value {}", value));
        let decoded = match self {
            OutputType::Text => OutputValue::Text(value.as_str().ok_or_else(bad)?.to_string()),
            OutputType::LastModified => {
                let text = value.as_str().ok_or_else(bad)?;
                let when = DateTime::parse_from_str(text, DATE_FORMAT).map_err(|_| bad())?;
                OutputValue::LastModified(when.with_timezone(&Utc))
            }
            OutputType::ImageDimensions => {
                let pair: (u32, u32) = serde_json::from_value(value.clone()).map_err(|_| bad())?;
                OutputValue::ImageDimensions(pair.0, pair.1)
            }
            OutputType::Fallback => OutputValue::Fallback(value.as_bool().ok_or_else(bad)?),
            OutputType::Dummy => return Err(bad()),
        };
        Ok(Some(decoded))
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputType::Text),
            "last-modified" => Ok(OutputType::LastModified),
            "image-dimensions" => Ok(OutputType::ImageDimensions),
            "fallback" => Ok(OutputType::Fallback),
            "dummy" => Ok(OutputType::Dummy),
            other => Err(EngineError::UnknownType(other.to_string())),
        }
    }
}

/// A converted value.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Text(String),
    LastModified(DateTime<Utc>),
    ImageDimensions(u32, u32),
    Fallback(bool),
}

impl OutputValue {
    pub fn output_type(&self) -> OutputType {
        match self {
            OutputValue::Text(_) => OutputType::Text,
            OutputValue::LastModified(_) => OutputType::LastModified,
            OutputValue::ImageDimensions(..) => OutputType::ImageDimensions,
            OutputValue::Fallback(_) => OutputType::Fallback,
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        self.output_type().encode(self)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Derives a typed value from a Resource. `Ok(None)` means the content had
/// nothing to offer (undecodable text, an unreadable image).
pub type Converter = fn(&dyn Resource) -> Result<Option<OutputValue>>;

#[derive(Default)]
pub struct ConversionRegistry {
    handlers: HashMap<(OutputType, Option<String>), Converter>,
}

impl ConversionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in conversion.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        text::register(&mut registry)?;
        image::register(&mut registry)?;
        basic::register(&mut registry)?;
        Ok(registry)
    }

    /// Registers `converter` for each MIME type, or as the wildcard for
    /// `output` when `mime_types` is empty.
    pub fn register(&mut self, output: OutputType, mime_types: &[&str], converter: Converter) -> Result<()> {
        if mime_types.is_empty() {
            return self.insert(output, None, converter);
        }
        for mime in mime_types {
            self.insert(output, Some(mime.to_string()), converter)?;
        }
        Ok(())
    }

    fn insert(&mut self, output: OutputType, mime: Option<String>, converter: Converter) -> Result<()> {
        let key = (output, mime);
        if self.handlers.contains_key(&key) {
            return Err(EngineError::DuplicateRegistration {
                registry: "conversion",
                key: format!("{}/{}", output, key.1.as_deref().unwrap_or("*")),
            });
        }
        self.handlers.insert(key, converter);
        Ok(())
    }

    /// The converter for `output` and `mime`: exact entry first, then the
    /// wildcard.
    pub fn lookup(&self, output: OutputType, mime: &str) -> Option<Converter> {
        self.handlers
            .get(&(output, Some(mime.to_string())))
            .or_else(|| self.handlers.get(&(output, None)))
            .copied()
    }

    /// Converts `resource` to `output`, using `mime_override` instead of
    /// the computed type when given. Returns `Ok(None)` when no conversion
    /// exists as well as when the conversion produced nothing.
    pub fn convert(
        &self,
        resource: &dyn Resource,
        output: OutputType,
        mime_override: Option<&str>,
    ) -> Result<Option<OutputValue>> {
        let mime = match mime_override {
            Some(mime) => mime.to_string(),
            None => resource.compute_type()?,
        };
        match self.lookup(output, &mime) {
            Some(converter) => converter(resource),
            None => {
                debug!(output = %output, mime = %mime, "No conversion registered");
                Ok(None)
            }
        }
    }
}
