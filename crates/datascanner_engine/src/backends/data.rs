//! Inline content carried in the Source itself (`data:` URLs).

use crate::error::{EngineError, Result};
use crate::model::source::str_prop;
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

pub const TYPE_LABEL: &str = "data";

/// The single leaf of a [`DataSource`].
const LEAF_NAME: &str = "file";

#[derive(Clone, PartialEq, Eq)]
pub struct DataSource {
    content: Arc<Vec<u8>>,
    mime: String,
}

impl DataSource {
    pub fn new(content: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        Self {
            content: Arc::new(content.into()),
            mime: mime.into(),
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn from_url(url: &str) -> Result<SourceRef> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "missing data: prefix"))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "missing ',' separator"))?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "only base64 payloads are supported"))?;
        let content = decode(payload)?;
        Ok(Arc::new(Self::new(content, mime)))
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        let content = decode(str_prop(obj, TYPE_LABEL, "content")?)?;
        Ok(Arc::new(Self::new(content, str_prop(obj, TYPE_LABEL, "mime")?)))
    }
}

fn decode(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| EngineError::malformed(TYPE_LABEL, format!("invalid base64: {}", e)))
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("mime", &self.mime)
            .field("len", &self.content.len())
            .finish()
    }
}

impl Source for DataSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("content".to_string(), Value::String(BASE64.encode(self.content.as_slice())));
        props.insert("mime".to_string(), Value::String(self.mime.clone()));
        props
    }

    fn open(&self, _sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        Ok(OpenState::new(Cookie::empty()).boxed())
    }

    fn handles(self: Arc<Self>, _sm: &mut SourceManager) -> Result<HandleIter> {
        let mime = self.mime.clone();
        let handle = Handle::new(self, LEAF_NAME).with_mime(mime);
        Ok(Box::new(std::iter::once(Ok(handle))))
    }

    fn follow(&self, handle: &Handle, _sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(Box::new(DataResource {
            handle: handle.clone(),
            content: Arc::clone(&self.content),
            cache: MetadataCache::default(),
        }))
    }

    fn to_url(&self) -> Option<String> {
        Some(format!("data:{};base64,{}", self.mime, BASE64.encode(self.content.as_slice())))
    }

    fn censor(&self) -> Option<SourceRef> {
        Some(Arc::new(DataSource::new(Vec::new(), self.mime.clone())))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DataResource {
    handle: Handle,
    content: Arc<Vec<u8>>,
    cache: MetadataCache,
}

impl Resource for DataResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.content.as_slice())))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(self.content.len() as u64)
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_scheme("data", DataSource::from_url)?;
    registry.register_type(TYPE_LABEL, DataSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_round_trip() {
        let registry = SourceRegistry::builtin().unwrap();
        let source: SourceRef = Arc::new(DataSource::new(b"Hello, world".to_vec(), "text/plain"));
        let url = source.to_url().unwrap();
        assert_eq!(url, "data:text/plain;base64,SGVsbG8sIHdvcmxk");
        assert_eq!(*registry.from_url(&url).unwrap(), *source);
        assert_eq!(*registry.from_json(&source.to_json_object()).unwrap(), *source);
    }

    #[test]
    fn test_single_handle_reads_back() {
        let source = Arc::new(DataSource::new(b"payload".to_vec(), "text/plain"));
        let mut sm = SourceManager::new();
        let handles: Vec<Handle> = source.handles(&mut sm).unwrap().map(|h| h.unwrap()).collect();
        assert_eq!(handles.len(), 1);
        let resource = handles[0].follow(&mut sm).unwrap();
        assert_eq!(resource.read_all().unwrap(), b"payload");
        assert_eq!(resource.compute_type().unwrap(), "text/plain");
    }

    #[test]
    fn test_rejects_non_base64() {
        assert!(DataSource::from_url("data:text/plain,hello").is_err());
    }
}
