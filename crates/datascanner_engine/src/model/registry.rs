//! Explicit dispatch tables for constructing Sources.
//!
//! A [`SourceRegistry`] is built once at startup and passed by reference.
//! Registering the same key twice is an error returned from the
//! registration call, so a misconfigured binary fails before it consumes
//! any messages.

use super::handle::Handle;
use super::manager::SourceManager;
use super::source::{opt_str_prop, str_prop, SourceRef};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Derivation levels allowed below a backend root before `from_handle`
/// stops treating containers as containers.
pub const MAX_DERIVATION_DEPTH: usize = 8;

/// Builds a Source from a URL.
pub type UrlFactory = fn(&str) -> Result<SourceRef>;

/// Builds a derived Source around a Handle.
pub type HandleFactory = fn(Handle) -> SourceRef;

/// Builds a Source from its JSON properties.
pub type JsonFactory = fn(&Map<String, Value>, &SourceRegistry) -> Result<SourceRef>;

pub struct SourceRegistry {
    by_scheme: HashMap<String, UrlFactory>,
    by_mime: HashMap<String, HandleFactory>,
    by_label: HashMap<String, JsonFactory>,
    max_depth: usize,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            by_scheme: HashMap::new(),
            by_mime: HashMap::new(),
            by_label: HashMap::new(),
            max_depth: MAX_DERIVATION_DEPTH,
        }
    }

    /// A registry holding every built-in backend and derived Source.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        crate::backends::register(&mut registry)?;
        crate::derived::register(&mut registry)?;
        Ok(registry)
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn register_scheme(&mut self, scheme: &str, factory: UrlFactory) -> Result<()> {
        insert_unique(&mut self.by_scheme, "URL scheme", scheme, factory)
    }

    pub fn register_mime(&mut self, mime: &str, factory: HandleFactory) -> Result<()> {
        insert_unique(&mut self.by_mime, "MIME type", mime, factory)
    }

    pub fn register_type(&mut self, type_label: &str, factory: JsonFactory) -> Result<()> {
        insert_unique(&mut self.by_label, "type label", type_label, factory)
    }

    /// Whether some derived Source handles this MIME type.
    pub fn is_container(&self, mime: &str) -> bool {
        self.by_mime.contains_key(mime)
    }

    pub fn from_url(&self, url: &str) -> Result<SourceRef> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| EngineError::UnknownScheme(url.to_string()))?;
        let factory = self
            .by_scheme
            .get(&scheme)
            .ok_or_else(|| EngineError::UnknownScheme(scheme.clone()))?;
        factory(url)
    }

    pub fn from_json(&self, value: &Value) -> Result<SourceRef> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::malformed("source", "expected a JSON object"))?;
        let label = str_prop(obj, "source", "type")?;
        let factory = self
            .by_label
            .get(label)
            .ok_or_else(|| EngineError::UnknownType(label.to_string()))?;
        factory(obj, self)
    }

    pub fn handle_from_json(&self, value: &Value) -> Result<Handle> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::malformed("handle", "expected a JSON object"))?;
        let label = str_prop(obj, "handle", "type")?;
        let source = self.from_json(
            obj.get("source")
                .ok_or_else(|| EngineError::malformed(label, "missing 'source'"))?,
        )?;
        if source.handle_label() != label {
            return Err(EngineError::UnknownType(format!(
                "{} (a {} source makes {} handles)",
                label,
                source.type_label(),
                source.handle_label()
            )));
        }
        let mut handle = Handle::new(source, str_prop(obj, label, "path")?);
        if let Some(mime) = opt_str_prop(obj, "mime") {
            handle = handle.with_mime(mime);
        }
        if let Some(title) = opt_str_prop(obj, "title") {
            handle = handle.with_title(title);
        }
        Ok(handle)
    }

    /// Derives a Source from a Handle whose content is a container.
    ///
    /// Without a manager the type is guessed from the name; with one, the
    /// Resource is opened and its content sniffed. Returns `None` when the
    /// type is not a container or when the derivation depth limit is hit.
    pub fn from_handle(&self, handle: &Handle, sm: Option<&mut SourceManager>) -> Result<Option<SourceRef>> {
        let mime = match sm {
            Some(sm) => handle.follow(sm)?.compute_type()?,
            None => handle.guess_type(),
        };
        self.from_handle_with_type(handle, &mime)
    }

    /// As [`SourceRegistry::from_handle`], for a type already computed.
    pub fn from_handle_with_type(&self, handle: &Handle, mime: &str) -> Result<Option<SourceRef>> {
        let Some(factory) = self.by_mime.get(mime) else {
            return Ok(None);
        };
        let depth = handle.source().depth() + 1;
        if depth > self.max_depth {
            warn!(handle = %handle, depth, "Derivation depth limit reached; not descending");
            return Ok(None);
        }
        Ok(Some(factory(handle.clone())))
    }
}

fn insert_unique<F>(map: &mut HashMap<String, F>, registry: &'static str, key: &str, value: F) -> Result<()> {
    if map.contains_key(key) {
        return Err(EngineError::DuplicateRegistration {
            registry,
            key: key.to_string(),
        });
    }
    map.insert(key.to_string(), value);
    Ok(())
}
