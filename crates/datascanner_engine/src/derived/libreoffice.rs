//! Office documents, converted to HTML by a headless LibreOffice.

use super::{handle_identity, handle_properties, inherited_timestamp, wrapped_handle, ConvertedDir};
use crate::error::Result;
use crate::model::{
    Cookie, Handle, HandleIter, OpenState, Resource, Source, SourceManager, SourceRef, SourceRegistry, SourceState,
};
use crate::subprocess;
use serde_json::{Map, Value};
use std::any::Any;
use std::ffi::OsString;
use std::sync::Arc;
use tempfile::TempDir;

pub const TYPE_LABEL: &str = "lo";
pub const OBJECT_LABEL: &str = "lo-object";

/// Document types handed to LibreOffice for conversion.
pub const MIME_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.oasis.opendocument.text",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.oasis.opendocument.spreadsheet",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibreOfficeSource {
    handle: Handle,
}

impl LibreOfficeSource {
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

/// Arguments for one conversion. Every run gets a private profile
/// directory so that concurrent conversions do not fight over a lock file.
fn convert_args(profile: &TempDir, output: &TempDir, document: &std::path::Path) -> Vec<OsString> {
    let mut profile_arg = OsString::from("-env:UserInstallation=file://");
    profile_arg.push(profile.path());
    vec![
        profile_arg,
        OsString::from("--headless"),
        OsString::from("--convert-to"),
        OsString::from("html"),
        OsString::from("--outdir"),
        output.path().as_os_str().to_owned(),
        document.as_os_str().to_owned(),
    ]
}

impl Source for LibreOfficeSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
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
        let resource = self.handle.follow(sm)?;
        let modified = inherited_timestamp(resource.as_ref());
        let document = resource.make_path()?;
        let profile = TempDir::new()?;
        let output = TempDir::new()?;
        subprocess::run(
            "libreoffice",
            convert_args(&profile, &output, &document),
            &self.handle.to_string(),
        )?;
        let converted = ConvertedDir {
            dir: output.path().to_path_buf(),
            modified,
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
    for mime in MIME_TYPES {
        registry.register_mime(mime, LibreOfficeSource::from_handle)?;
    }
    registry.register_type(TYPE_LABEL, LibreOfficeSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;

    #[test]
    fn test_office_types_are_containers() {
        let registry = SourceRegistry::builtin().unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new("/srv").unwrap());
        let docx = registry
            .from_handle(&Handle::new(root, "letter.docx"), None)
            .unwrap()
            .unwrap();
        assert_eq!(docx.type_label(), TYPE_LABEL);
        assert_eq!(docx.handle_label(), OBJECT_LABEL);
    }

    #[test]
    fn test_profile_directory_is_private() {
        let profile = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let args = convert_args(&profile, &output, std::path::Path::new("/tmp/a.odt"));
        let first = args[0].to_string_lossy().into_owned();
        assert_eq!(first, format!("-env:UserInstallation=file://{}", profile.path().display()));
        assert_eq!(args.last().unwrap(), "/tmp/a.odt");
    }
}
