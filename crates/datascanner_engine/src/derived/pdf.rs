//! PDF documents, split into pages, each page converted to HTML and images
//! by `pdftohtml`.

use super::{handle_identity, handle_properties, inherited_timestamp, wrapped_handle, ConvertedDir};
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, ScopedPath, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use crate::subprocess;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const TYPE_LABEL: &str = "pdf";
pub const PAGE_LABEL: &str = "pdf-page";
pub const OBJECT_LABEL: &str = "pdf-object";
pub const MIME: &str = "application/pdf";
/// Type of the per-page Handles of a [`PdfSource`].
pub const PAGE_TYPE: &str = "application/x.os2datascanner.pdf-page";

/// The parts of `pdfinfo` output the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfInfo {
    pub pages: u32,
    pub author: Option<String>,
}

pub(crate) fn parse_pdfinfo(output: &str) -> PdfInfo {
    let mut info = PdfInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Pages" => info.pages = value.parse().unwrap_or(0),
            "Author" if !value.is_empty() => info.author = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

/// Runs `pdfinfo` on a local file.
pub fn pdfinfo(path: &Path) -> Result<PdfInfo> {
    let output = subprocess::run("pdfinfo", [path], &path.display().to_string())?;
    Ok(parse_pdfinfo(&String::from_utf8_lossy(&output.stdout)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfSource {
    handle: Handle,
}

impl PdfSource {
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

/// A local copy of the document and what `pdfinfo` said about it.
struct PdfDocument {
    copy: ScopedPath,
    pages: u32,
    modified: Option<DateTime<Utc>>,
}

impl Source for PdfSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        PAGE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        handle_properties(&self.handle)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        handle_identity(&self.handle)
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let resource = self.handle.follow(sm)?;
        let modified = inherited_timestamp(resource.as_ref());
        let copy = resource.make_path()?;
        let info = pdfinfo(copy.path()).map_err(|e| EngineError::unavailable(&self.handle, e))?;
        Ok(OpenState::new(Cookie::local(PdfDocument {
            copy,
            pages: info.pages,
            modified,
        }))
        .boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let document = sm.open_as::<PdfDocument>(&this)?;
        Ok(Box::new((1..=document.pages).map(move |page| {
            Ok(Handle::new(Arc::clone(&this), page.to_string()).with_mime(PAGE_TYPE))
        })))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(Box::new(PageResource {
            handle: handle.clone(),
            document: sm.open_as::<PdfDocument>(handle.source())?,
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

/// A page is only ever a container: its content is reached by deriving a
/// [`PdfPageSource`] from it.
struct PageResource {
    handle: Handle,
    document: Arc<PdfDocument>,
    cache: MetadataCache,
}

impl Resource for PageResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        Err(EngineError::unsupported(&self.handle, "streaming"))
    }

    fn fetch_size(&self) -> Result<u64> {
        Err(EngineError::unsupported(&self.handle, "size"))
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.document.modified)
    }

    fn fetch_type(&self) -> Result<String> {
        Ok(PAGE_TYPE.to_string())
    }
}

/// The files `pdftohtml` extracts from one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfPageSource {
    handle: Handle,
}

impl PdfPageSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn from_handle(handle: Handle) -> SourceRef {
        Arc::new(Self::new(handle))
    }

    fn from_json(obj: &Map<String, Value>, registry: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(wrapped_handle(obj, PAGE_LABEL, registry)?)))
    }
}

impl Source for PdfPageSource {
    fn type_label(&self) -> &'static str {
        PAGE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        OBJECT_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        handle_properties(&self.handle)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        handle_identity(&self.handle)
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let document = sm.open_as::<PdfDocument>(self.handle.source())?;
        let page = self.handle.relative_path();
        let output = TempDir::new()?;
        let prefix = output.path().join("out");
        let args: [&OsStr; 7] = [
            OsStr::new("-q"),
            OsStr::new("-f"),
            OsStr::new(page),
            OsStr::new("-l"),
            OsStr::new(page),
            document.copy.as_os_str(),
            prefix.as_os_str(),
        ];
        subprocess::run("pdftohtml", args, &self.handle.to_string())?;
        let converted = ConvertedDir {
            dir: output.path().to_path_buf(),
            modified: document.modified,
        };
        Ok(OpenState::new(Cookie::shareable(converted)).with_guard(output).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let converted = sm.open_as::<ConvertedDir>(&this)?;
        Ok(converted.handles(this))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(sm.open_as::<ConvertedDir>(handle.source())?.follow(handle))
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

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_mime(MIME, PdfSource::from_handle)?;
    registry.register_mime(PAGE_TYPE, PdfPageSource::from_handle)?;
    registry.register_type(TYPE_LABEL, PdfSource::from_json)?;
    registry.register_type(PAGE_LABEL, PdfPageSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;

    #[test]
    fn test_parse_pdfinfo() {
        let output = "Title:          Budget\nAuthor:         Jens Hansen\nPages:          14\nEncrypted:      no\n";
        assert_eq!(
            parse_pdfinfo(output),
            PdfInfo {
                pages: 14,
                author: Some("Jens Hansen".to_string()),
            }
        );
        assert_eq!(parse_pdfinfo("Author:\nPages: 2\n").author, None);
    }

    #[test]
    fn test_page_handles_lead_to_page_sources() {
        let registry = SourceRegistry::builtin().unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new("/srv").unwrap());
        let pdf = registry
            .from_handle(&Handle::new(root, "report.pdf"), None)
            .unwrap()
            .unwrap();
        assert_eq!(pdf.type_label(), TYPE_LABEL);

        let page = Handle::new(pdf, "3").with_mime(PAGE_TYPE);
        assert_eq!(page.type_label(), PAGE_LABEL);
        let page_source = registry.from_handle(&page, None).unwrap().unwrap();
        assert_eq!(page_source.type_label(), PAGE_LABEL);
        assert_eq!(page_source.depth(), 2);
        assert_eq!(*registry.from_json(&page_source.to_json_object()).unwrap(), *page_source);
    }
}
