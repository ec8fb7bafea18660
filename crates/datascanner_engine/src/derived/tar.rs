//! Members of uncompressed tar archives. Compressed archives reach this
//! Source through a filtered Source first.

use super::{handle_identity, handle_properties, wrapped_handle};
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, ScopedPath, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

pub const TYPE_LABEL: &str = "tar";
pub const MIME: &str = "application/x-tar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarSource {
    handle: Handle,
}

impl TarSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn from_handle(handle: Handle) -> SourceRef {
        Arc::new(Self::new(handle))
    }

    fn from_json(obj: &Map<String, Value>, registry: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(wrapped_handle(obj, TYPE_LABEL, registry)?)))
    }
}

#[derive(Debug, Clone)]
struct Member {
    /// Byte offset of the member's data in the archive file.
    offset: u64,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Index of a tar file's regular members, built in one pass at open time.
struct TarIndex {
    copy: ScopedPath,
    order: Vec<String>,
    members: HashMap<String, Member>,
}

impl TarIndex {
    fn build(copy: ScopedPath) -> Result<Self> {
        let mut archive = ::tar::Archive::new(File::open(copy.path())?);
        let mut order = Vec::new();
        let mut members = HashMap::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().replace('\\', "/");
            let modified = entry
                .header()
                .mtime()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
            members.insert(
                name.clone(),
                Member {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                    modified,
                },
            );
            order.push(name);
        }
        Ok(Self { copy, order, members })
    }

    fn member(&self, handle: &Handle) -> Result<&Member> {
        self.members
            .get(handle.relative_path())
            .ok_or_else(|| EngineError::unavailable(handle, "no such member"))
    }
}

impl Source for TarSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        handle_properties(&self.handle)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        handle_identity(&self.handle)
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let copy = self.handle.follow(sm)?.make_path()?;
        let index = TarIndex::build(copy).map_err(|e| EngineError::unavailable(&self.handle, e))?;
        Ok(OpenState::new(Cookie::local(index)).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let index = sm.open_as::<TarIndex>(&this)?;
        let names = index.order.clone();
        Ok(Box::new(
            names
                .into_iter()
                .map(move |name| Ok(Handle::new(Arc::clone(&this), name))),
        ))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(Box::new(TarResource {
            handle: handle.clone(),
            index: sm.open_as::<TarIndex>(handle.source())?,
            cache: MetadataCache::default(),
        }))
    }

    fn derived_from(&self) -> Option<&Handle> {
        Some(&self.handle)
    }

    fn censor(&self) -> Option<SourceRef> {
        Some(Arc::new(Self::new(self.handle.censor())))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TarResource {
    handle: Handle,
    index: Arc<TarIndex>,
    cache: MetadataCache,
}

impl Resource for TarResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let member = self.index.member(&self.handle)?;
        let mut file = File::open(self.index.copy.path())?;
        file.seek(SeekFrom::Start(member.offset))?;
        Ok(Box::new(file.take(member.size)))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(self.index.member(&self.handle)?.size)
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.index.member(&self.handle)?.modified)
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_mime(MIME, TarSource::from_handle)?;
    registry.register_type(TYPE_LABEL, TarSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;
    use tempfile::TempDir;

    fn append(builder: &mut ::tar::Builder<File>, name: &str, content: &[u8]) {
        let mut header = ::tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }

    #[test]
    fn test_members_read_back() {
        let tmp = TempDir::new().unwrap();
        let mut builder = ::tar::Builder::new(File::create(tmp.path().join("bundle.tar")).unwrap());
        append(&mut builder, "one.txt", b"first member");
        append(&mut builder, "nested/two.txt", b"second");
        builder.finish().unwrap();
        drop(builder);

        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let tar: SourceRef = Arc::new(TarSource::new(Handle::new(root, "bundle.tar")));
        let mut sm = SourceManager::new();
        let handles: Vec<Handle> = tar.handles(&mut sm).unwrap().map(Result::unwrap).collect();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[1].relative_path(), "nested/two.txt");

        let first = handles[0].follow(&mut sm).unwrap();
        assert_eq!(first.read_all().unwrap(), b"first member");
        assert_eq!(first.get_size().unwrap(), 12);
        assert_eq!(first.get_last_modified().unwrap().unwrap().timestamp(), 1_700_000_000);
        assert_eq!(handles[1].follow(&mut sm).unwrap().read_all().unwrap(), b"second");
    }
}
