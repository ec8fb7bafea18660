//! Windows shares, mounted read-only through the kernel CIFS client.

use super::file::{walk_files, FilesystemResource};
use crate::error::{EngineError, Result};
use crate::model::source::{opt_str_prop, str_prop};
use crate::model::{
    Cookie, Handle, HandleIter, OpenState, Resource, Source, SourceManager, SourceRef, SourceRegistry,
    SourceState,
};
use crate::subprocess;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::any::Any;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const TYPE_LABEL: &str = "smb";

/// `[domain;]user[:password]@server`, every part but the server optional.
static NETLOC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(((?P<domain>\w+);)?(?P<username>\w+)(:(?P<password>\w+))?@)?(?P<unc>[\w.-]+)$")
        .expect("valid netloc regex")
});

/// Where a share lives and how to log in to it. Shared by the mounting and
/// the `smbclient`-driven Sources.
#[derive(Clone, PartialEq, Eq)]
pub struct SmbLocation {
    pub unc: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    /// Presentation only.
    pub driveletter: Option<String>,
}

impl SmbLocation {
    pub fn new(unc: impl Into<String>) -> Self {
        Self {
            unc: unc.into(),
            user: None,
            password: None,
            domain: None,
            driveletter: None,
        }
    }

    pub fn with_credentials(
        mut self,
        user: Option<String>,
        password: Option<String>,
        domain: Option<String>,
    ) -> Self {
        self.user = user;
        self.password = password;
        self.domain = domain;
        self
    }

    /// Parses `<scheme>://[domain;]user[:password]@server/share/path`.
    pub fn parse_url(scheme: &str, url: &str) -> Result<Self> {
        let normalised = url.replace('\\', "/");
        let rest = normalised
            .strip_prefix(scheme)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| EngineError::malformed(scheme, format!("not a {} URL: {}", scheme, url)))?;
        let (netloc, path) = rest.split_once('/').unwrap_or((rest, ""));
        let caps = NETLOC
            .captures(netloc)
            .ok_or_else(|| EngineError::malformed(scheme, format!("bad server part: {}", netloc)))?;
        let path = urlencoding::decode(path)
            .map_err(|e| EngineError::malformed(scheme, e.to_string()))?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        Ok(Self::new(format!("//{}/{}", &caps["unc"], path)).with_credentials(
            group("username"),
            group("password"),
            group("domain"),
        ))
    }

    pub fn to_url(&self, scheme: &str) -> String {
        let unc = self.unc.replace('\\', "/");
        let trimmed = unc.trim_start_matches('/');
        let (server, path) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        let mut netloc = String::new();
        if let Some(user) = &self.user {
            if let Some(domain) = &self.domain {
                netloc.push_str(domain);
                netloc.push(';');
            }
            netloc.push_str(user);
            if let Some(password) = &self.password {
                netloc.push(':');
                netloc.push_str(password);
            }
            netloc.push('@');
        }
        netloc.push_str(server);
        let path: Vec<String> = path.split('/').map(|s| urlencoding::encode(s).into_owned()).collect();
        format!("{}://{}/{}", scheme, netloc, path.join("/"))
    }

    pub fn from_json(label: &str, obj: &Map<String, Value>) -> Result<Self> {
        let mut location = Self::new(str_prop(obj, label, "unc")?).with_credentials(
            opt_str_prop(obj, "user"),
            opt_str_prop(obj, "password"),
            opt_str_prop(obj, "domain"),
        );
        location.driveletter = opt_str_prop(obj, "driveletter");
        Ok(location)
    }

    pub fn properties(&self, include_presentation: bool) -> Map<String, Value> {
        let opt = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        let mut props = Map::new();
        props.insert("unc".to_string(), Value::String(self.unc.clone()));
        props.insert("user".to_string(), opt(&self.user));
        props.insert("password".to_string(), opt(&self.password));
        props.insert("domain".to_string(), opt(&self.domain));
        if include_presentation {
            props.insert("driveletter".to_string(), opt(&self.driveletter));
        }
        props
    }

    /// Copy without any credentials.
    pub fn censored(&self) -> Self {
        Self {
            unc: self.unc.clone(),
            driveletter: self.driveletter.clone(),
            ..Self::new("")
        }
    }

    /// `mount.cifs` option string.
    fn mount_options(&self) -> String {
        let mut opts = vec!["ro".to_string()];
        if let Some(user) = &self.user {
            opts.push(format!("user={}", user));
        }
        match &self.password {
            Some(password) => opts.push(format!("password={}", password)),
            None => opts.push("guest".to_string()),
        }
        if let Some(domain) = &self.domain {
            opts.push(format!("domain={}", domain));
        }
        opts.join(",")
    }
}

impl fmt::Debug for SmbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmbLocation")
            .field("unc", &self.unc)
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

/// A share mounted on a temporary directory for the life of the Source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbSource {
    location: SmbLocation,
}

impl SmbSource {
    pub fn new(location: SmbLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &SmbLocation {
        &self.location
    }

    pub fn from_url(url: &str) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(SmbLocation::parse_url(TYPE_LABEL, url)?)))
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(SmbLocation::from_json(TYPE_LABEL, obj)?)))
    }
}

fn unmount(mount_point: PathBuf) -> Result<()> {
    let what = mount_point.display().to_string();
    subprocess::run("umount", [&mount_point], &what)?;
    // Only an empty directory is removed; a failed unmount must never lead
    // to deleting files on the share.
    fs::remove_dir(&mount_point)?;
    Ok(())
}

impl Source for SmbSource {
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
        let mount_point = tempfile::Builder::new()
            .prefix("datascanner-smb-")
            .tempdir()?
            .keep();
        let options = self.location.mount_options();
        let args: [&OsStr; 6] = [
            OsStr::new("-t"),
            OsStr::new("cifs"),
            OsStr::new(&self.location.unc),
            mount_point.as_os_str(),
            OsStr::new("-o"),
            OsStr::new(&options),
        ];
        let mounted = subprocess::run("mount", args, &self.location.unc);
        if let Err(err) = mounted {
            let _ = fs::remove_dir(&mount_point);
            return Err(err);
        }
        info!(unc = %self.location.unc, mount_point = %mount_point.display(), "Mounted share");

        let for_close = mount_point.clone();
        Ok(OpenState::new(Cookie::shareable(mount_point))
            .on_close(move || unmount(for_close))
            .boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let mount_point = sm.open_as::<PathBuf>(&this)?;
        Ok(Box::new(
            walk_files(&mount_point).map(move |rel| rel.map(|rel| Handle::new(Arc::clone(&this), rel))),
        ))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        let mount_point = sm.open_as::<PathBuf>(handle.source())?;
        Ok(Box::new(FilesystemResource::new(
            handle.clone(),
            mount_point.join(handle.relative_path()),
        )))
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

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_scheme(TYPE_LABEL, SmbSource::from_url)?;
    registry.register_type(TYPE_LABEL, SmbSource::from_json)
}
