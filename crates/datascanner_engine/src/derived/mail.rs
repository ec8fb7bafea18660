//! E-mail messages, split into their MIME leaves.

use super::{handle_identity, handle_properties, inherited_timestamp, wrapped_handle};
use crate::error::{EngineError, Result};
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use serde_json::{Map, Value};
use std::any::Any;
use std::io::{Cursor, Read};
use std::sync::Arc;

pub const TYPE_LABEL: &str = "mail";
pub const PART_LABEL: &str = "mail-part";
pub const MAIL_MIME: &str = "message/rfc822";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSource {
    handle: Handle,
}

impl MailSource {
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

/// The raw message. Parsing borrows from it, so it is re-parsed on demand
/// rather than stored parsed.
struct RawMessage {
    bytes: Vec<u8>,
    sent: Option<DateTime<Utc>>,
}

impl RawMessage {
    fn parse(&self, what: &Handle) -> Result<ParsedMail<'_>> {
        mailparse::parse_mail(&self.bytes).map_err(|e| EngineError::unavailable(what, e))
    }
}

/// File name of a leaf part, from its disposition or its content type.
fn part_filename(part: &ParsedMail<'_>) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
}

/// Collects `(path, mime)` for every non-multipart part, depth first.
/// Paths are the child indices joined with `/`, followed by the file name.
fn collect_leaves(part: &ParsedMail<'_>, indices: &mut Vec<usize>, out: &mut Vec<(String, String)>) {
    if part.subparts.is_empty() {
        let mut segments: Vec<String> = indices.iter().map(usize::to_string).collect();
        segments.push(part_filename(part).unwrap_or_default());
        out.push((segments.join("/"), part.ctype.mimetype.clone()));
        return;
    }
    for (index, child) in part.subparts.iter().enumerate() {
        indices.push(index);
        collect_leaves(child, indices, out);
        indices.pop();
    }
}

/// Walks from the root message to the part a leaf path names.
fn find_part<'a, 'm>(root: &'a ParsedMail<'m>, path: &str) -> Option<&'a ParsedMail<'m>> {
    let mut segments: Vec<&str> = path.split('/').collect();
    segments.pop();
    let mut current = root;
    for segment in segments {
        current = current.subparts.get(segment.parse::<usize>().ok()?)?;
    }
    Some(current)
}

impl Source for MailSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        PART_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        handle_properties(&self.handle)
    }

    fn eq_properties(&self) -> Map<String, Value> {
        handle_identity(&self.handle)
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let resource = self.handle.follow(sm)?;
        let bytes = resource.read_all()?;
        let sent = mailparse::parse_headers(&bytes)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("Date"))
            .and_then(|date| mailparse::dateparse(&date).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| inherited_timestamp(resource.as_ref()));
        Ok(OpenState::new(Cookie::local(RawMessage { bytes, sent })).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self.clone();
        let message = sm.open_as::<RawMessage>(&this)?;
        let parsed = message.parse(&self.handle)?;
        let mut leaves = Vec::new();
        collect_leaves(&parsed, &mut Vec::new(), &mut leaves);
        Ok(Box::new(leaves.into_iter().map(move |(path, mime)| {
            Ok(Handle::new(Arc::clone(&this), path).with_mime(mime))
        })))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        Ok(Box::new(MailPartResource {
            handle: handle.clone(),
            message: sm.open_as::<RawMessage>(handle.source())?,
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

struct MailPartResource {
    handle: Handle,
    message: Arc<RawMessage>,
    cache: MetadataCache,
}

impl MailPartResource {
    /// Decoded body of the part. Text parts are converted to UTF-8 from
    /// their declared charset; everything else is returned as raw bytes.
    fn body(&self) -> Result<Vec<u8>> {
        let parsed = self.message.parse(&self.handle)?;
        let part = find_part(&parsed, self.handle.relative_path())
            .ok_or_else(|| EngineError::unavailable(&self.handle, "no such part"))?;
        let body = if part.ctype.mimetype.starts_with("text/") {
            part.get_body().map(String::into_bytes)
        } else {
            part.get_body_raw()
        };
        body.map_err(|e| EngineError::unavailable(&self.handle, e))
    }
}

impl Resource for MailPartResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.body()?)))
    }

    fn fetch_size(&self) -> Result<u64> {
        Ok(self.body()?.len() as u64)
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.message.sent)
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_mime(MAIL_MIME, MailSource::from_handle)?;
    registry.register_type(TYPE_LABEL, MailSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::data::DataSource;

    const MESSAGE: &str = "From: a@example.org\r\n\
To: b@example.org\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
Subject: figures\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
See attached.\r\n\
--XX\r\n\
Content-Type: text/csv\r\n\
Content-Disposition: attachment; filename=\"figures.csv\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
YSxiCjEsMgo=\r\n\
--XX--\r\n";

    fn mail_source() -> SourceRef {
        let data: SourceRef = Arc::new(DataSource::new(MESSAGE.as_bytes().to_vec(), MAIL_MIME));
        Arc::new(MailSource::new(Handle::new(data, "file").with_mime(MAIL_MIME)))
    }

    #[test]
    fn test_leaves_carry_paths_and_types() {
        let mut sm = SourceManager::new();
        let leaves: Vec<Handle> = mail_source().handles(&mut sm).unwrap().map(Result::unwrap).collect();
        let described: Vec<(&str, Option<&str>)> = leaves.iter().map(|h| (h.relative_path(), h.mime())).collect();
        assert_eq!(
            described,
            vec![("0/", Some("text/plain")), ("1/figures.csv", Some("text/csv"))]
        );

        let attachment = leaves[1].follow(&mut sm).unwrap();
        assert_eq!(attachment.read_all().unwrap(), b"a,b\n1,2\n");
        assert_eq!(
            attachment.get_last_modified().unwrap().unwrap().to_rfc3339(),
            "2024-03-05T10:00:00+00:00"
        );
        assert_eq!(attachment.compute_type().unwrap(), "text/csv");
    }

    #[test]
    fn test_bad_part_path_is_unavailable() {
        let mut sm = SourceManager::new();
        let bogus = Handle::new(mail_source(), "7/nothing.txt").with_mime("text/plain");
        let err = bogus.follow(&mut sm).unwrap().read_all().unwrap_err();
        assert!(err.is_unavailable());
    }
}
