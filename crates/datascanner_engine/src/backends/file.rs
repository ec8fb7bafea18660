//! Local filesystem Source, plus the Resource type shared by every Source
//! whose leaves end up as plain files on disk.

use crate::error::{EngineError, Result};
use crate::model::source::str_prop;
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, ScopedPath, Source, SourceManager,
    SourceRef, SourceRegistry, SourceState,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub const TYPE_LABEL: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemSource {
    path: PathBuf,
}

impl FilesystemSource {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(EngineError::malformed(
                TYPE_LABEL,
                format!("path must be absolute: {}", path.display()),
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn from_url(url: &str) -> Result<SourceRef> {
        let parsed = url::Url::parse(url).map_err(|e| EngineError::malformed(TYPE_LABEL, e.to_string()))?;
        let path = parsed
            .to_file_path()
            .map_err(|_| EngineError::malformed(TYPE_LABEL, format!("not a local path: {}", url)))?;
        Ok(Arc::new(Self::new(path)?))
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(str_prop(obj, TYPE_LABEL, "path")?)?))
    }
}

impl Source for FilesystemSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("path".to_string(), Value::String(self.path.to_string_lossy().into_owned()));
        props
    }

    fn open(&self, _sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        if !self.path.is_dir() {
            return Err(EngineError::unavailable(self.path.display(), "not a directory"));
        }
        Ok(OpenState::new(Cookie::shareable(self.path.clone())).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let root = sm.open_as::<PathBuf>(&this)?;
        Ok(Box::new(
            walk_files(&root).map(move |rel| rel.map(|rel| Handle::new(Arc::clone(&this), rel))),
        ))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        let root = sm.open_as::<PathBuf>(handle.source())?;
        Ok(Box::new(FilesystemResource::new(
            handle.clone(),
            root.join(handle.relative_path()),
        )))
    }

    fn to_url(&self) -> Option<String> {
        url::Url::from_file_path(&self.path).ok().map(String::from)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Relative paths always use forward slashes.
fn normalize_path_to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every regular file below `root`, as a forward-slash path relative to it.
/// Unreadable directories come out as errors without ending the walk.
pub(crate) fn walk_files(root: &Path) -> impl Iterator<Item = Result<String>> + Send + 'static {
    let root = root.to_path_buf();
    WalkDir::new(root.clone())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                Some(Ok(normalize_path_to_forward_slashes(rel)))
            }
            Ok(_) => None,
            Err(err) => {
                let what = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                Some(Err(EngineError::unavailable(what, err)))
            }
        })
}

/// A leaf that is a file on the local disk.
pub struct FilesystemResource {
    handle: Handle,
    path: PathBuf,
    cache: MetadataCache,
}

impl FilesystemResource {
    pub fn new(handle: Handle, path: PathBuf) -> Self {
        Self {
            handle,
            path,
            cache: MetadataCache::default(),
        }
    }

    pub fn full_path(&self) -> &Path {
        &self.path
    }

    fn metadata(&self) -> Result<fs::Metadata> {
        fs::metadata(&self.path).map_err(|e| EngineError::unavailable(self.path.display(), e))
    }
}

impl Resource for FilesystemResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let file = File::open(&self.path).map_err(|e| EngineError::unavailable(self.path.display(), e))?;
        Ok(Box::new(file))
    }

    fn make_path(&self) -> Result<ScopedPath> {
        Ok(ScopedPath::borrowed(&self.path))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.metadata()?.modified().ok().map(DateTime::<Utc>::from))
    }

    #[cfg(unix)]
    fn owner_uid(&self) -> Option<u32> {
        use std::os::unix::fs::MetadataExt;
        self.metadata().ok().map(|m| m.uid())
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_scheme("file", FilesystemSource::from_url)?;
    registry.register_type(TYPE_LABEL, FilesystemSource::from_json)
}
