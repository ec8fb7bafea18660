//! Single-stream compression formats: the one leaf is the decompressed
//! content, named after the compressed file minus its extension.

use super::{handle_identity, handle_properties, inherited_timestamp, wrapped_handle};
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use bzip2::read::BzDecoder;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde_json::{Map, Value};
use std::any::Any;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use xz2::read::XzDecoder;

/// Label of the Handles every filtered Source produces.
pub const HANDLE_LABEL: &str = "filtered";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Bzip2,
    Lzma,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Bzip2 => "bz2",
            Codec::Lzma => "lzma",
        }
    }

    fn decoder<'a>(&self, compressed: Box<dyn Read + Send + 'a>) -> Box<dyn Read + Send + 'a> {
        match self {
            Codec::Gzip => Box::new(MultiGzDecoder::new(compressed)),
            Codec::Bzip2 => Box::new(BzDecoder::new(compressed)),
            Codec::Lzma => Box::new(XzDecoder::new(compressed)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredSource {
    handle: Handle,
    codec: Codec,
}

impl FilteredSource {
    pub fn new(handle: Handle, codec: Codec) -> Self {
        Self { handle, codec }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Name of the single leaf.
    fn leaf_name(&self) -> String {
        let name = self.handle.name();
        Path::new(name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    }

    fn from_json(codec: Codec, obj: &Map<String, Value>, registry: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(wrapped_handle(obj, codec.as_str(), registry)?, codec)))
    }
}

fn gzip_from_handle(handle: Handle) -> SourceRef {
    Arc::new(FilteredSource::new(handle, Codec::Gzip))
}

fn bzip2_from_handle(handle: Handle) -> SourceRef {
    Arc::new(FilteredSource::new(handle, Codec::Bzip2))
}

fn lzma_from_handle(handle: Handle) -> SourceRef {
    Arc::new(FilteredSource::new(handle, Codec::Lzma))
}

impl Source for FilteredSource {
    fn type_label(&self) -> &'static str {
        self.codec.as_str()
    }

    fn handle_label(&self) -> &'static str {
        HANDLE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        handle_properties(&self.handle)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        handle_identity(&self.handle)
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        // Following the wrapped Handle now ties its Source's lifetime to ours.
        self.handle.follow(sm)?;
        Ok(OpenState::new(Cookie::empty()).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self.clone();
        sm.open(&this)?;
        let leaf = Handle::new(this, self.leaf_name());
        Ok(Box::new(std::iter::once(Ok(leaf))))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        sm.open(handle.source())?;
        Ok(Box::new(FilteredResource {
            handle: handle.clone(),
            compressed: self.handle.follow(sm)?,
            codec: self.codec,
            cache: MetadataCache::default(),
        }))
    }

    fn derived_from(&self) -> Option<&Handle> {
        Some(&self.handle)
    }

    fn censor(&self) -> Option<SourceRef> {
        Some(Arc::new(Self::new(self.handle.censor(), self.codec)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct FilteredResource {
    handle: Handle,
    compressed: Box<dyn Resource>,
    codec: Codec,
    cache: MetadataCache,
}

impl FilteredResource {
    fn corrupt(&self, err: io::Error) -> EngineError {
        EngineError::unavailable(&self.handle, err)
    }

    /// Modification time recorded in a gzip header, if any.
    fn gzip_mtime(&self) -> Result<Option<DateTime<Utc>>> {
        let mut decoder = MultiGzDecoder::new(self.compressed.make_stream()?);
        let mut first = [0u8; 1];
        decoder.read(&mut first).map_err(|e| self.corrupt(e))?;
        Ok(decoder
            .header()
            .map(|header| header.mtime())
            .filter(|&mtime| mtime != 0)
            .and_then(|mtime| DateTime::from_timestamp(i64::from(mtime), 0)))
    }
}

impl Resource for FilteredResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(self.codec.decoder(self.compressed.make_stream()?))
    }

    fn fetch_size(&self) -> Result<u64> {
        io::copy(&mut self.make_stream()?, &mut io::sink()).map_err(|e| self.corrupt(e))
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        if self.codec == Codec::Gzip {
            if let Some(mtime) = self.gzip_mtime()? {
                return Ok(Some(mtime));
            }
        }
        Ok(inherited_timestamp(self.compressed.as_ref()))
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_mime("application/gzip", gzip_from_handle)?;
    registry.register_mime("application/x-gzip", gzip_from_handle)?;
    registry.register_mime("application/x-bzip2", bzip2_from_handle)?;
    registry.register_mime("application/x-xz", lzma_from_handle)?;
    registry.register_type(Codec::Gzip.as_str(), |obj, registry| {
        FilteredSource::from_json(Codec::Gzip, obj, registry)
    })?;
    registry.register_type(Codec::Bzip2.as_str(), |obj, registry| {
        FilteredSource::from_json(Codec::Bzip2, obj, registry)
    })?;
    registry.register_type(Codec::Lzma.as_str(), |obj, registry| {
        FilteredSource::from_json(Codec::Lzma, obj, registry)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;
    use flate2::write::GzEncoder;
    use flate2::{Compression, GzBuilder};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_gzip_leaf_is_decompressed() {
        let tmp = TempDir::new().unwrap();
        let mut encoder = GzBuilder::new()
            .mtime(1_600_000_000)
            .write(std::fs::File::create(tmp.path().join("notes.txt.gz")).unwrap(), Compression::default());
        encoder.write_all(b"plain words").unwrap();
        encoder.finish().unwrap();

        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let gz: SourceRef = Arc::new(FilteredSource::new(Handle::new(root, "notes.txt.gz"), Codec::Gzip));
        let mut sm = SourceManager::new();
        let leaves: Vec<Handle> = gz.handles(&mut sm).unwrap().map(Result::unwrap).collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].relative_path(), "notes.txt");
        assert_eq!(leaves[0].type_label(), HANDLE_LABEL);

        let resource = leaves[0].follow(&mut sm).unwrap();
        assert_eq!(resource.read_all().unwrap(), b"plain words");
        assert_eq!(resource.get_size().unwrap(), 11);
        assert_eq!(resource.get_last_modified().unwrap().unwrap().timestamp(), 1_600_000_000);
        assert_eq!(resource.compute_type().unwrap(), "text/plain");
    }

    #[test]
    fn test_garbage_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"x").unwrap();
        let mut bytes = encoder.finish().unwrap();
        bytes.truncate(4);
        std::fs::write(tmp.path().join("cut.gz"), bytes).unwrap();

        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let gz = FilteredSource::new(Handle::new(root, "cut.gz"), Codec::Gzip);
        let mut sm = SourceManager::new();
        let leaf = Handle::new(Arc::new(gz), "cut");
        let err = leaf.follow(&mut sm).unwrap().get_size().unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_labels_per_codec() {
        let registry = SourceRegistry::builtin().unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new("/srv").unwrap());
        let bz: SourceRef = Arc::new(FilteredSource::new(Handle::new(root, "dump.sql.bz2"), Codec::Bzip2));
        assert_eq!(bz.type_label(), "bz2");
        assert_eq!(*registry.from_json(&bz.to_json_object()).unwrap(), *bz);
    }
}
