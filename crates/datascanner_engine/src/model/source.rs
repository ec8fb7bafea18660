//! The Source trait: the root of an explorable hierarchy.

use super::handle::Handle;
use super::manager::{SourceManager, SourceState};
use super::resource::Resource;
use crate::error::Result;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Shared reference to a Source. Sources are immutable values, so they are
/// passed around by `Arc` and compared by value.
pub type SourceRef = Arc<dyn Source>;

/// Lazy sequence of Handles produced by [`Source::handles`].
pub type HandleIter = Box<dyn Iterator<Item = Result<Handle>> + Send>;

/// A place that might contain data.
///
/// Implementations keep their properties in plain fields and describe
/// them through [`Source::properties`]. Identity is the type label plus
/// [`Source::eq_properties`], so two Sources built from the same
/// configuration are the same Source as far as a [`SourceManager`] is
/// concerned.
pub trait Source: fmt::Debug + Send + Sync + 'static {
    /// Label used as the `"type"` discriminator in JSON.
    fn type_label(&self) -> &'static str;

    /// Label of the Handles this Source produces.
    fn handle_label(&self) -> &'static str;

    /// Serialisable properties, without the `"type"` key.
    fn properties(&self) -> Map<String, Value>;

    /// Properties that take part in equality. Defaults to all of them.
    fn eq_properties(&self) -> Map<String, Value> {
        self.properties()
    }

    /// Performs the one-shot backend work (connect, mount, unpack) needed
    /// before Handles can be enumerated or followed.
    ///
    /// Never call this directly; go through [`SourceManager::open`], which
    /// memoizes the result and arranges for it to be closed.
    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>>;

    /// Enumerates the leaves of this Source.
    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter>;

    /// Resolves one of this Source's Handles to a Resource.
    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>>;

    /// URL form, for Sources that have one.
    fn to_url(&self) -> Option<String> {
        None
    }

    /// The Handle this Source was derived from, if any.
    fn derived_from(&self) -> Option<&Handle> {
        None
    }

    /// A copy of this Source with credentials removed, when it has any.
    fn censor(&self) -> Option<SourceRef> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Opaque identity of a Source within a [`SourceManager`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(String);

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl dyn Source {
    /// Full JSON representation, keyed by type label.
    pub fn to_json_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(self.type_label().to_string()));
        obj.extend(self.properties());
        Value::Object(obj)
    }

    /// Type label plus [`Source::eq_properties`].
    pub fn identity_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(self.type_label().to_string()));
        obj.extend(self.eq_properties());
        Value::Object(obj)
    }

    /// Identity key. `serde_json::Map` keeps its keys sorted, so equal
    /// property sets always render to the same string.
    pub fn key(&self) -> SourceKey {
        let props = Value::Object(self.eq_properties());
        SourceKey(format!("{}:{}", self.type_label(), props))
    }

    /// Number of derivation steps between this Source and a backend root.
    pub fn depth(&self) -> usize {
        match self.derived_from() {
            Some(handle) => 1 + handle.source().depth(),
            None => 0,
        }
    }

    /// Downcast to a concrete Source type.
    pub fn downcast_ref<T: Source>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for dyn Source {
    fn eq(&self, other: &Self) -> bool {
        self.type_label() == other.type_label() && self.eq_properties() == other.eq_properties()
    }
}

impl Eq for dyn Source {}

impl Hash for dyn Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl fmt::Display for dyn Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(handle) = self.derived_from() {
            return write!(f, "{} in {}", self.type_label(), handle);
        }
        match self.censored_url() {
            Some(url) => f.write_str(&url),
            None => write!(f, "{}", self.type_label()),
        }
    }
}

impl dyn Source {
    fn censored_url(&self) -> Option<String> {
        match self.censor() {
            Some(censored) => censored.to_url(),
            None => self.to_url(),
        }
    }
}

/// Same Source with credentials removed.
pub fn censored(source: &SourceRef) -> SourceRef {
    source.censor().unwrap_or_else(|| Arc::clone(source))
}

/// Fetch a required string property from a JSON object.
pub(crate) fn str_prop<'a>(obj: &'a Map<String, Value>, label: &str, key: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| crate::EngineError::malformed(label, format!("missing string property '{}'", key)))
}

/// Fetch an optional string property from a JSON object.
pub(crate) fn opt_str_prop(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}
