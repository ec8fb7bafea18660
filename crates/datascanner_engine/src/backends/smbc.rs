//! Windows shares accessed in user space through `smbclient`, for hosts
//! where mounting is not allowed.

use super::smb::SmbLocation;
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, ScopedPath, Source, SourceManager,
    SourceRef, SourceRegistry, SourceState,
};
use crate::model::resource::safe_file_name;
use crate::subprocess;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde_json::{Map, Value};
use std::any::Any;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;

pub const TYPE_LABEL: &str = "smbc";

static LISTING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^  (?P<name>.*?)\s+(?P<attrs>[A-Z]*)\s+(?P<size>\d+)\s+(?P<date>\w{3} \w{3} [ \d]\d \d{2}:\d{2}:\d{2} \d{4})$",
    )
    .expect("valid listing regex")
});

/// One file reported by `smbclient ls`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListingEntry {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Parses the output of `recurse ON; ls`. Directory headers look like
/// `\sub\dir`; entries are indented by two spaces.
pub(crate) fn parse_listing(output: &str) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let mut current_dir = String::new();
    for line in output.lines() {
        if let Some(dir) = line.strip_prefix('\\') {
            current_dir = dir.replace('\\', "/").trim_matches('/').to_string();
            continue;
        }
        let Some(caps) = LISTING_LINE.captures(line) else {
            continue;
        };
        let name = &caps["name"];
        if name == "." || name == ".." || caps["attrs"].contains('D') {
            continue;
        }
        let path = if current_dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", current_dir, name)
        };
        let modified = NaiveDateTime::parse_from_str(&caps["date"], "%a %b %e %H:%M:%S %Y")
            .ok()
            .map(|naive| naive.and_utc());
        entries.push(ListingEntry {
            path,
            size: caps["size"].parse().unwrap_or(0),
            modified,
        });
    }
    entries
}

/// Connection parameters handed out as this Source's cookie.
#[derive(Debug)]
struct Session {
    service: String,
    base_dir: String,
    auth: Vec<String>,
}

impl Session {
    fn new(location: &SmbLocation) -> Self {
        let unc = location.unc.replace('\\', "/");
        let parts: Vec<&str> = unc.trim_start_matches('/').splitn(3, '/').collect();
        let service = format!("//{}/{}", parts.first().unwrap_or(&""), parts.get(1).unwrap_or(&""));
        let base_dir = parts.get(2).map(|s| s.trim_matches('/').to_string()).unwrap_or_default();

        let mut auth = Vec::new();
        match &location.user {
            Some(user) => {
                auth.push("-U".to_string());
                auth.push(format!("{}%{}", user, location.password.as_deref().unwrap_or("")));
            }
            None => auth.push("-N".to_string()),
        }
        if let Some(domain) = &location.domain {
            auth.push("-W".to_string());
            auth.push(domain.clone());
        }
        Self {
            service,
            base_dir,
            auth,
        }
    }

    fn remote_path(&self, relative: &str) -> String {
        let joined = if self.base_dir.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.base_dir, relative)
        };
        joined.replace('/', "\\")
    }

    fn command(&self, script: &str) -> Result<String> {
        let mut args = vec![self.service.clone()];
        args.extend(self.auth.iter().cloned());
        args.push("-c".to_string());
        args.push(script.to_string());
        let output = subprocess::run("smbclient", &args, &self.service)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn list(&self) -> Result<Vec<ListingEntry>> {
        let script = if self.base_dir.is_empty() {
            "recurse ON; ls".to_string()
        } else {
            format!("cd \"{}\"; recurse ON; ls", self.base_dir.replace('/', "\\"))
        };
        Ok(parse_listing(&self.command(&script)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbcSource {
    location: SmbLocation,
}

impl SmbcSource {
    pub fn new(location: SmbLocation) -> Self {
        Self { location }
    }

    pub fn from_url(url: &str) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(SmbLocation::parse_url(TYPE_LABEL, url)?)))
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(SmbLocation::from_json(TYPE_LABEL, obj)?)))
    }
}

impl Source for SmbcSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        self.location.properties(true)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        self.location.properties(false)
    }

    fn open(&self, _sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        Ok(OpenState::new(Cookie::shareable(Session::new(&self.location))).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let session = sm.open_as::<Session>(&this)?;
        let entries = session.list()?;
        Ok(Box::new(
            entries
                .into_iter()
                .map(move |entry| Ok(Handle::new(Arc::clone(&this), entry.path))),
        ))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        let session = sm.open_as::<Session>(handle.source())?;
        Ok(Box::new(SmbcResource {
            handle: handle.clone(),
            session,
            entry: OnceCell::new(),
            cache: MetadataCache::default(),
        }))
    }

    fn to_url(&self) -> Option<String> {
        Some(self.location.to_url(TYPE_LABEL))
    }

    fn censor(&self) -> Option<SourceRef> {
        Some(Arc::new(Self::new(self.location.censored())))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SmbcResource {
    handle: Handle,
    session: Arc<Session>,
    entry: OnceCell<ListingEntry>,
    cache: MetadataCache,
}

impl SmbcResource {
    fn entry(&self) -> Result<&ListingEntry> {
        self.entry.get_or_try_init(|| {
            let remote = self.session.remote_path(self.handle.relative_path());
            let listing = self.session.command(&format!("ls \"{}\"", remote))?;
            parse_listing(&listing)
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::unavailable(&self.handle, "not found on share"))
        })
    }
}

/// A downloaded copy, removed once the reader is dropped.
struct Download {
    file: File,
    _path: ScopedPath,
}

impl Read for Download {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Resource for SmbcResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_path(&self) -> Result<ScopedPath> {
        let dir = TempDir::new()?;
        let local = dir.path().join(safe_file_name(self.handle.name()));
        let remote = self.session.remote_path(self.handle.relative_path());
        self.session
            .command(&format!("get \"{}\" \"{}\"", remote, local.display()))?;
        Ok(ScopedPath::temporary(dir, local))
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let path = self.make_path()?;
        let file = File::open(path.path())?;
        Ok(Box::new(Download { file, _path: path }))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(self.entry()?.size)
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entry()?.modified)
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_scheme(TYPE_LABEL, SmbcSource::from_url)?;
    registry.register_type(TYPE_LABEL, SmbcSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "  .                                   D        0  Mon Jan 15 10:20:30 2024
  ..                                  D        0  Mon Jan 15 10:20:30 2024
  report.docx                         A    12288  Tue Feb  6 08:01:02 2024
  Archive                             D        0  Mon Jan 15 10:20:30 2024

\\Archive
  .                                   D        0  Mon Jan 15 10:20:30 2024
  old notes.txt                       A       42  Wed Mar 13 17:45:00 2019

\t\t51175 blocks of size 4096. 20456 blocks available
";

    #[test]
    fn test_parse_recursive_listing() {
        let entries = parse_listing(LISTING);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "report.docx");
        assert_eq!(entries[0].size, 12288);
        assert_eq!(entries[1].path, "Archive/old notes.txt");
        assert_eq!(
            entries[1].modified.unwrap().format("%Y-%m-%d %H:%M").to_string(),
            "2019-03-13 17:45"
        );
    }

    #[test]
    fn test_session_splits_service_and_directory() {
        let location = SmbLocation::new("//server/share/sub/dir")
            .with_credentials(Some("bob".into()), Some("pw".into()), Some("LAB".into()));
        let session = Session::new(&location);
        assert_eq!(session.service, "//server/share");
        assert_eq!(session.base_dir, "sub/dir");
        assert_eq!(session.auth, vec!["-U", "bob%pw", "-W", "LAB"]);
        assert_eq!(session.remote_path("a/b.txt"), "sub\\dir\\a\\b.txt");
    }

    #[test]
    fn test_url_round_trip_keeps_scheme() {
        let registry = SourceRegistry::builtin().unwrap();
        let source = registry.from_url("smbc://bob@server/share/docs").unwrap();
        assert_eq!(source.type_label(), "smbc");
        assert_eq!(source.to_url().unwrap(), "smbc://bob@server/share/docs");
    }
}
