//! Best-effort guesses at who is responsible for a Resource.
//!
//! Each guess is a labelled value. Document metadata names the people who
//! created or last modified a file; filesystem ownership names the account
//! that owns it. None of them is authoritative.

use crate::conversions::html_to_text;
use crate::derived::pdf::{self, MIME as PDF_MIME};
use crate::error::Result;
use crate::model::{Handle, Resource, SourceManager};
use ::zip::ZipArchive;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::ffi::CStr;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const ODF_PREFIX: &str = "application/vnd.oasis.opendocument.";
const OOXML_PREFIX: &str = "application/vnd.openxmlformats-officedocument.";

fn element(name: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{0}(?:\s[^>]*)?>(.*?)</{0}>", regex::escape(name))).expect("static regex")
}

static DC_CREATOR: Lazy<Regex> = Lazy::new(|| element("dc:creator"));
static ODF_INITIAL_CREATOR: Lazy<Regex> = Lazy::new(|| element("meta:initial-creator"));
static OOXML_LAST_MODIFIED_BY: Lazy<Regex> = Lazy::new(|| element("cp:lastModifiedBy"));

/// Text of the first `pattern` element in `xml`, unescaped and trimmed.
fn element_text(pattern: &Regex, xml: &str) -> Option<String> {
    let text = html_to_text(pattern.captures(xml)?.get(1)?.as_str());
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Reads one member of a zip-based document.
fn zip_member(path: &Path, member: &str) -> Option<String> {
    let mut archive = ZipArchive::new(File::open(path).ok()?).ok()?;
    let mut entry = archive.by_name(member).ok()?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml).ok()?;
    Some(xml)
}

fn insert_text(guesses: &mut Map<String, Value>, label: &str, value: Option<String>) {
    if let Some(value) = value {
        guesses.insert(label.to_string(), Value::String(value));
    }
}

/// Login name of a numeric user ID.
pub fn user_name(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 16384];
    // SAFETY: an all-zero passwd is a valid value for getpwuid_r to fill in.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: every pointer refers to live storage of the advertised size.
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut found) };
    if rc != 0 || found.is_null() || pwd.pw_name.is_null() {
        return None;
    }
    // SAFETY: on success pw_name points into `buf`, NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

fn document_guesses(resource: &dyn Resource, mime: &str, guesses: &mut Map<String, Value>) -> Result<()> {
    if mime.starts_with(ODF_PREFIX) {
        let path = resource.make_path()?;
        if let Some(xml) = zip_member(&path, "meta.xml") {
            insert_text(guesses, "od-modifier", element_text(&DC_CREATOR, &xml));
            insert_text(guesses, "od-creator", element_text(&ODF_INITIAL_CREATOR, &xml));
        }
    } else if mime.starts_with(OOXML_PREFIX) {
        let path = resource.make_path()?;
        if let Some(xml) = zip_member(&path, "docProps/core.xml") {
            insert_text(guesses, "ooxml-modifier", element_text(&OOXML_LAST_MODIFIED_BY, &xml));
            insert_text(guesses, "ooxml-creator", element_text(&DC_CREATOR, &xml));
        }
    } else if mime == PDF_MIME {
        let path = resource.make_path()?;
        match pdf::pdfinfo(&path) {
            Ok(info) => insert_text(guesses, "pdf-author", info.author),
            Err(e) => debug!(handle = %resource.handle(), error = %e, "No PDF metadata"),
        }
    }
    Ok(())
}

/// Labelled guesses at the people responsible for `handle`'s content.
///
/// Labels: `od-modifier`/`od-creator` (OpenDocument), `ooxml-modifier`/
/// `ooxml-creator` (Office Open XML), `pdf-author`, and
/// `filesystem-owner-uid` with `filesystem-owner` when the UID resolves to
/// a user. Documents whose metadata cannot be read simply contribute
/// nothing; a Resource that cannot be reached at all is an error.
pub fn guess_responsible_party(handle: &Handle, sm: &mut SourceManager) -> Result<Map<String, Value>> {
    let resource = handle.follow(sm)?;
    let mut guesses = Map::new();

    let guessed = handle.guess_type();
    let mime = if guessed.starts_with(ODF_PREFIX) || guessed.starts_with(OOXML_PREFIX) {
        guessed
    } else {
        resource.compute_type()?
    };
    document_guesses(resource.as_ref(), &mime, &mut guesses)?;

    if let Some(uid) = resource.owner_uid() {
        guesses.insert("filesystem-owner-uid".to_string(), Value::from(uid));
        insert_text(&mut guesses, "filesystem-owner", user_name(uid));
    }
    Ok(guesses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;
    use crate::model::SourceRef;
    use ::zip::write::{FileOptions, ZipWriter};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CORE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties"
    xmlns:dc="http://purl.org/dc/elements/1.1/">
  <dc:creator>Karen Blixen</dc:creator>
  <cp:lastModifiedBy>S&#248;ren Kierkegaard</cp:lastModifiedBy>
</cp:coreProperties>"#;

    #[test]
    fn test_ooxml_properties_and_owner() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ZipWriter::new(File::create(tmp.path().join("memo.docx")).unwrap());
        writer.start_file("docProps/core.xml", FileOptions::default()).unwrap();
        writer.write_all(CORE_XML.as_bytes()).unwrap();
        writer.finish().unwrap();

        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let mut sm = SourceManager::new();
        let guesses = guess_responsible_party(&Handle::new(root, "memo.docx"), &mut sm).unwrap();
        assert_eq!(guesses["ooxml-creator"], "Karen Blixen");
        assert_eq!(guesses["ooxml-modifier"], "Søren Kierkegaard");
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        assert_eq!(guesses["filesystem-owner-uid"], uid);
    }

    #[test]
    fn test_odf_meta() {
        let xml = "<office:meta><meta:initial-creator>Anna</meta:initial-creator>\
                   <dc:creator>Bo</dc:creator></office:meta>";
        assert_eq!(element_text(&ODF_INITIAL_CREATOR, xml).as_deref(), Some("Anna"));
        assert_eq!(element_text(&DC_CREATOR, xml).as_deref(), Some("Bo"));
        assert_eq!(element_text(&DC_CREATOR, "<dc:creator> </dc:creator>"), None);
    }

    #[test]
    fn test_root_is_named() {
        assert_eq!(user_name(0).as_deref(), Some("root"));
    }
}
