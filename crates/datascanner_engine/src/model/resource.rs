//! Resources: the opened, content-accessible form of a Handle.

use super::handle::Handle;
use crate::error::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Bytes inspected when sniffing a content type.
const SNIFF_LEN: u64 = 8192;

/// Per-instance cache behind the idempotent metadata accessors.
#[derive(Debug, Default)]
pub struct MetadataCache {
    size: OnceCell<u64>,
    last_modified: OnceCell<Option<DateTime<Utc>>>,
    mime: OnceCell<String>,
}

/// Short-lived, content-accessible embodiment of a Handle.
///
/// Implementors supply the uncached `fetch_*` primitives; callers use the
/// `get_size`/`get_last_modified`/`compute_type` accessors on
/// `dyn Resource`, which compute each value at most once.
pub trait Resource: Send {
    fn handle(&self) -> &Handle;

    fn cache(&self) -> &MetadataCache;

    /// Opens the content for reading.
    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>>;

    /// A local path holding the content, valid while the returned value
    /// lives. The default spools the stream into a temporary file.
    fn make_path(&self) -> Result<ScopedPath> {
        let dir = TempDir::new()?;
        let path = dir.path().join(safe_file_name(self.handle().name()));
        let mut out = File::create(&path)?;
        io::copy(&mut self.make_stream()?, &mut out)?;
        Ok(ScopedPath::temporary(dir, path))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(io::copy(&mut self.make_stream()?, &mut io::sink())?)
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Content-based type estimate. Falls back to the Handle's guess when
    /// the leading bytes are not recognised.
    fn fetch_type(&self) -> Result<String> {
        if let Some(mime) = self.handle().mime() {
            return Ok(mime.to_string());
        }
        let mut head = Vec::new();
        self.make_stream()?.take(SNIFF_LEN).read_to_end(&mut head)?;
        Ok(sniff_type(&head).unwrap_or_else(|| self.handle().guess_type()))
    }

    /// Numeric owner of the underlying file, where that means anything.
    fn owner_uid(&self) -> Option<u32> {
        None
    }
}

impl dyn Resource + '_ {
    pub fn get_size(&self) -> Result<u64> {
        self.cache().size.get_or_try_init(|| self.fetch_size()).copied()
    }

    pub fn get_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.cache()
            .last_modified
            .get_or_try_init(|| self.fetch_last_modified())
            .copied()
    }

    pub fn compute_type(&self) -> Result<String> {
        self.cache()
            .mime
            .get_or_try_init(|| self.fetch_type())
            .cloned()
    }

    /// Reads the whole content into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.make_stream()?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Identify a content type from its leading bytes.
pub fn sniff_type(head: &[u8]) -> Option<String> {
    if head.is_empty() {
        return None;
    }
    infer::get(head).map(|kind| normalise_mime(kind.mime_type()).to_string())
}

fn normalise_mime(mime: &str) -> &str {
    match mime {
        "application/x-gzip" => "application/gzip",
        "image/bmp" => "image/x-ms-bmp",
        "application/x-zip-compressed" => "application/zip",
        other => other,
    }
}

/// Strip path separators so a member name can be used as a file name.
pub(crate) fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' || ch == '\0' { '_' } else { ch })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "resource".to_string()
    } else {
        cleaned
    }
}

/// A local path that may be backed by a temporary directory, removed on drop.
#[derive(Debug)]
pub struct ScopedPath {
    path: PathBuf,
    _scratch: Option<TempDir>,
}

impl ScopedPath {
    /// A path owned by someone else (a real file on disk).
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _scratch: None,
        }
    }

    /// A path inside `dir`, deleted together with it.
    pub fn temporary(dir: TempDir, path: PathBuf) -> Self {
        Self {
            path,
            _scratch: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for ScopedPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for ScopedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_magic() {
        assert_eq!(sniff_type(b"%PDF-1.4\n").as_deref(), Some("application/pdf"));
        assert_eq!(sniff_type(&[0x1f, 0x8b, 0x08, 0x00]).as_deref(), Some("application/gzip"));
        assert_eq!(sniff_type(b"just words"), None);
        assert_eq!(sniff_type(b""), None);
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("a/b.txt"), "a_b.txt");
        assert_eq!(safe_file_name(".."), "resource");
    }

    #[test]
    fn test_scoped_path_removes_scratch() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let file = root.join("x");
        std::fs::write(&file, b"x").unwrap();
        let scoped = ScopedPath::temporary(dir, file.clone());
        assert!(scoped.exists());
        drop(scoped);
        assert!(!root.exists());
    }
}
