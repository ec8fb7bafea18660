//! Derived Sources: hierarchies synthesised from the content of a Handle.
//!
//! Every derived Source wraps exactly one Handle. Its `open` follows that
//! Handle through the same [`SourceManager`], which records the wrapped
//! Handle's Source as the parent of the derived one; closing the parent
//! therefore always closes the derived state first.

pub mod filtered;
pub mod libreoffice;
pub mod mail;
pub mod pdf;
pub mod tar;
pub mod zip;

use crate::backends::file::{walk_files, FilesystemResource};
use crate::error::{EngineError, Result};
use crate::model::{Handle, HandleIter, MetadataCache, Resource, ScopedPath, SourceRef, SourceRegistry};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// JSON properties shared by every derived Source.
pub(crate) fn handle_properties(handle: &Handle) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("handle".to_string(), handle.to_json_object());
    props
}

/// Equality properties shared by every derived Source. Presentation-only
/// parts of the wrapped Handle are left out.
pub(crate) fn handle_identity(handle: &Handle) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("handle".to_string(), handle.identity_object());
    props
}

/// Reads the wrapped Handle back out of a derived Source's JSON.
pub(crate) fn wrapped_handle(obj: &Map<String, Value>, label: &str, registry: &SourceRegistry) -> Result<Handle> {
    let value = obj
        .get("handle")
        .ok_or_else(|| EngineError::malformed(label, "missing 'handle'"))?;
    registry.handle_from_json(value)
}

/// Output directory of an external conversion program, plus the timestamp
/// of the document it was produced from.
#[derive(Debug, Clone)]
pub(crate) struct ConvertedDir {
    pub dir: PathBuf,
    pub modified: Option<DateTime<Utc>>,
}

impl ConvertedDir {
    pub fn handles(&self, this: SourceRef) -> HandleIter {
        Box::new(walk_files(&self.dir).map(move |rel| rel.map(|rel| Handle::new(Arc::clone(&this), rel))))
    }

    pub fn follow(&self, handle: &Handle) -> Box<dyn Resource> {
        Box::new(ConvertedResource {
            file: FilesystemResource::new(handle.clone(), self.dir.join(handle.relative_path())),
            modified: self.modified,
            cache: MetadataCache::default(),
        })
    }
}

/// A converted file, which reports the original document's timestamp
/// rather than the time the converter ran.
struct ConvertedResource {
    file: FilesystemResource,
    modified: Option<DateTime<Utc>>,
    cache: MetadataCache,
}

impl Resource for ConvertedResource {
    fn handle(&self) -> &Handle {
        self.file.handle()
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        self.file.make_stream()
    }

    fn make_path(&self) -> Result<ScopedPath> {
        self.file.make_path()
    }

    fn fetch_size(&self) -> Result<u64> {
        self.file.fetch_size()
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.modified)
    }
}

/// Last-modified time of a wrapped Resource; a backend that cannot tell
/// counts as having no timestamp.
pub(crate) fn inherited_timestamp(resource: &dyn Resource) -> Option<DateTime<Utc>> {
    resource.get_last_modified().ok().flatten()
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    zip::register(registry)?;
    tar::register(registry)?;
    filtered::register(registry)?;
    pdf::register(registry)?;
    libreoffice::register(registry)?;
    mail::register(registry)
}
