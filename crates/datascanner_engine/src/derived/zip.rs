//! Members of zip archives.

use super::{handle_identity, handle_properties, wrapped_handle};
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, ScopedPath, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use ::zip::result::ZipError;
use ::zip::ZipArchive;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TYPE_LABEL: &str = "zip";
pub const MIME: &str = "application/zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipSource {
    handle: Handle,
}

impl ZipSource {
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

/// The opened archive. The local copy it reads from lives exactly as long
/// as the archive does.
struct OpenArchive {
    archive: Mutex<ZipArchive<File>>,
    _copy: ScopedPath,
}

impl OpenArchive {
    fn lock(&self) -> MutexGuard<'_, ZipArchive<File>> {
        self.archive.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn zip_error(what: &Handle, err: ZipError) -> EngineError {
    EngineError::unavailable(what, err)
}

impl Source for ZipSource {
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
        let file = File::open(copy.path())?;
        let archive = ZipArchive::new(file).map_err(|e| zip_error(&self.handle, e))?;
        Ok(OpenState::new(Cookie::local(OpenArchive {
            archive: Mutex::new(archive),
            _copy: copy,
        }))
        .boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self.clone();
        let opened = sm.open_as::<OpenArchive>(&this)?;
        let mut archive = opened.lock();
        let mut members = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index).map_err(|e| zip_error(&self.handle, e))?;
            if !entry.is_dir() {
                members.push(entry.name().to_string());
            }
        }
        Ok(Box::new(
            members
                .into_iter()
                .map(move |name| Ok(Handle::new(Arc::clone(&this), name))),
        ))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(Box::new(ZipResource {
            handle: handle.clone(),
            opened: sm.open_as::<OpenArchive>(handle.source())?,
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

struct ZipResource {
    handle: Handle,
    opened: Arc<OpenArchive>,
    cache: MetadataCache,
}

impl ZipResource {
    fn member<T>(&self, f: impl FnOnce(&mut ::zip::read::ZipFile<'_>) -> Result<T>) -> Result<T> {
        let mut archive = self.opened.lock();
        let mut entry = archive
            .by_name(self.handle.relative_path())
            .map_err(|e| zip_error(&self.handle, e))?;
        f(&mut entry)
    }
}

impl Resource for ZipResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Spools the member into an anonymous temporary file, since the
    /// archive stays locked while an entry is being read. The size the
    /// archive declares is not trusted.
    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let mut spool = self.member(|entry| {
            let mut spool = tempfile::tempfile()?;
            io::copy(entry, &mut spool)?;
            Ok(spool)
        })?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }

    fn fetch_size(&self) -> Result<u64> {
        self.member(|entry| Ok(entry.size()))
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.member(|entry| {
            let stamp = entry.last_modified();
            Ok(
                NaiveDate::from_ymd_opt(stamp.year().into(), stamp.month().into(), stamp.day().into())
                    .and_then(|date| {
                        date.and_hms_opt(stamp.hour().into(), stamp.minute().into(), stamp.second().into())
                    })
                    .map(|naive| naive.and_utc()),
            )
        })
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_mime(MIME, ZipSource::from_handle)?;
    registry.register_type(TYPE_LABEL, ZipSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;
    use ::zip::write::FileOptions;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    fn write_archive(dir: &TempDir) {
        let file = File::create(dir.path().join("bundle.zip")).unwrap();
        let mut writer = ::zip::ZipWriter::new(file);
        writer.add_directory("docs/", FileOptions::default()).unwrap();
        writer.start_file("docs/a.txt", FileOptions::default()).unwrap();
        writer.write_all(b"first").unwrap();
        writer.start_file("b.txt", FileOptions::default()).unwrap();
        writer.write_all(b"second").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_members_skip_directories() {
        let tmp = TempDir::new().unwrap();
        write_archive(&tmp);
        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let zip: SourceRef = Arc::new(ZipSource::new(Handle::new(root, "bundle.zip")));

        let mut sm = SourceManager::new();
        let handles: Vec<Handle> = zip.clone().handles(&mut sm).unwrap().map(Result::unwrap).collect();
        let names: Vec<&str> = handles.iter().map(Handle::relative_path).collect();
        assert_eq!(names, vec!["docs/a.txt", "b.txt"]);

        let resource = handles[1].follow(&mut sm).unwrap();
        assert_eq!(resource.read_all().unwrap(), b"second");
        assert_eq!(resource.get_size().unwrap(), 6);
        assert!(resource.get_last_modified().unwrap().is_some());
    }

    /// Overwrites the uncompressed size in every central directory header.
    fn inflate_declared_sizes(archive: &mut [u8], size: u32) {
        let mut at = 0;
        while at + 28 <= archive.len() {
            if archive[at..at + 4] == [0x50, 0x4b, 0x01, 0x02] {
                archive[at + 24..at + 28].copy_from_slice(&size.to_le_bytes());
                at += 46;
            } else {
                at += 1;
            }
        }
    }

    #[test]
    fn test_declared_size_is_not_trusted_when_reading() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ::zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored = FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
        writer.start_file("small.txt", stored).unwrap();
        writer.write_all(b"hello").unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();
        inflate_declared_sizes(&mut bytes, 0xFFFF_FFF0);
        std::fs::write(tmp.path().join("liar.zip"), &bytes).unwrap();

        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let zip: SourceRef = Arc::new(ZipSource::new(Handle::new(root, "liar.zip")));
        let mut sm = SourceManager::new();
        let handle = zip.handles(&mut sm).unwrap().next().unwrap().unwrap();
        let resource = handle.follow(&mut sm).unwrap();
        assert_eq!(resource.get_size().unwrap(), 0xFFFF_FFF0);
        assert_eq!(resource.read_all().unwrap(), b"hello");
    }

    #[test]
    fn test_corrupt_archive_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("broken.zip"), b"PK\x03\x04 not really").unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let zip: SourceRef = Arc::new(ZipSource::new(Handle::new(root, "broken.zip")));
        let err = zip.handles(&mut SourceManager::new()).err().unwrap();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_json_round_trip() {
        let registry = SourceRegistry::builtin().unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new("/srv").unwrap());
        let zip: SourceRef = Arc::new(ZipSource::new(Handle::new(root, "a/b.zip")));
        assert_eq!(*registry.from_json(&zip.to_json_object()).unwrap(), *zip);
        assert_eq!(zip.depth(), 1);
        assert_eq!(zip.to_string(), "zip in \"a/b.zip\" (in file:///srv)");
    }
}
