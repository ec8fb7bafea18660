//! Handles: addresses of single leaves within a Source.

use super::manager::SourceManager;
use super::resource::Resource;
use super::source::{censored, SourceRef};
use crate::error::Result;
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// MIME type used when a name says nothing about its content.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// An immutable (Source, relative path) pair.
///
/// `mime` is an authoritative type hint carried by Sources that know their
/// children's types up front (mail parts) and takes part in equality.
/// `title` is presentation-only (a mail subject, say) and does not.
#[derive(Clone)]
pub struct Handle {
    source: SourceRef,
    relative_path: String,
    mime: Option<String>,
    title: Option<String>,
}

impl Handle {
    pub fn new(source: SourceRef, relative_path: impl Into<String>) -> Self {
        Self {
            source,
            relative_path: relative_path.into(),
            mime: None,
            title: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Type label, which is always the label its Source hands out.
    pub fn type_label(&self) -> &'static str {
        self.source.handle_label()
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.relative_path)
    }

    /// Cheap MIME estimate from the name alone.
    pub fn guess_type(&self) -> String {
        if let Some(mime) = &self.mime {
            return mime.clone();
        }
        mime_guess::from_path(self.name())
            .first_raw()
            .unwrap_or(OCTET_STREAM)
            .to_string()
    }

    /// Resolves this Handle to a Resource through the given manager.
    pub fn follow(&self, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        self.source.follow(self, sm)
    }

    /// Same Handle over a censored Source.
    pub fn censor(&self) -> Handle {
        Handle {
            source: censored(&self.source),
            ..self.clone()
        }
    }

    pub fn to_json_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(self.type_label().to_string()));
        obj.insert("source".to_string(), self.source.to_json_object());
        obj.insert("path".to_string(), Value::String(self.relative_path.clone()));
        if let Some(mime) = &self.mime {
            obj.insert("mime".to_string(), Value::String(mime.clone()));
        }
        if let Some(title) = &self.title {
            obj.insert("title".to_string(), Value::String(title.clone()));
        }
        Value::Object(obj)
    }

    /// The JSON form restricted to what takes part in equality: no title,
    /// and the Source reduced to its identifying properties.
    pub fn identity_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(self.type_label().to_string()));
        obj.insert("source".to_string(), self.source.identity_object());
        obj.insert("path".to_string(), Value::String(self.relative_path.clone()));
        if let Some(mime) = &self.mime {
            obj.insert("mime".to_string(), Value::String(mime.clone()));
        }
        Value::Object(obj)
    }

    /// Human-readable location for reports.
    pub fn presentation(&self) -> String {
        match &self.title {
            Some(title) => format!("\"{}\" (in {})", title, self.source),
            None => format!("\"{}\" (in {})", self.relative_path, self.source),
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
            && self.mime == other.mime
            && (Arc::ptr_eq(&self.source, &other.source) || *self.source == *other.source)
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.key().hash(state);
        self.relative_path.hash(state);
        self.mime.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type", &self.type_label())
            .field("source", &self.source)
            .field("path", &self.relative_path)
            .field("mime", &self.mime)
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.presentation())
    }
}
