//! Exchange mailboxes, read through EWS with an impersonating service
//! account.

use crate::backoff::{run_with_backoff, BackoffParams};
use crate::derived::mail::MAIL_MIME;
use crate::error::{EngineError, Result};
use crate::model::source::str_prop;
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const TYPE_LABEL: &str = "ews";
pub const OFFICE_365_ENDPOINT: &str = "https://outlook.office365.com/EWS/Exchange.asmx";

const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

macro_rules! xml_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($pattern).expect("valid EWS regex"));
    };
}

xml_regex!(FOLDER_BLOCK, r"(?s)<(?:\w+:)?Folder>(.*?)</(?:\w+:)?Folder>");
xml_regex!(MESSAGE_BLOCK, r"(?s)<(?:\w+:)?Message>(.*?)</(?:\w+:)?Message>");
xml_regex!(FOLDER_ID, r#"<(?:\w+:)?FolderId Id="([^"]+)""#);
xml_regex!(ITEM_ID, r#"<(?:\w+:)?ItemId Id="([^"]+)""#);
xml_regex!(FOLDER_CLASS, r"<(?:\w+:)?FolderClass>([^<]*)<");
xml_regex!(TOTAL_COUNT, r"<(?:\w+:)?TotalCount>(\d+)<");
xml_regex!(SUBJECT, r"(?s)<(?:\w+:)?Subject>(.*?)</(?:\w+:)?Subject>");
xml_regex!(MIME_CONTENT, r"(?s)<(?:\w+:)?MimeContent[^>]*>([^<]*)<");
xml_regex!(RECEIVED, r"<(?:\w+:)?DateTimeReceived>([^<]+)<");
xml_regex!(SIZE, r"<(?:\w+:)?Size>(\d+)<");
xml_regex!(RESPONSE_CODE, r"<(?:\w+:)?ResponseCode>(\w+)<");
xml_regex!(LAST_IN_RANGE, r#"IncludesLastItemInRange="(true|false)""#);

#[derive(Clone, PartialEq, Eq)]
pub struct EwsAccountSource {
    domain: String,
    server: String,
    admin_user: String,
    admin_password: String,
    user: String,
}

impl EwsAccountSource {
    pub fn new(
        domain: impl Into<String>,
        server: impl Into<String>,
        admin_user: impl Into<String>,
        admin_password: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            server: server.into(),
            admin_user: admin_user.into(),
            admin_password: admin_password.into(),
            user: user.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }

    fn endpoint(&self) -> String {
        if self.server.is_empty() {
            OFFICE_365_ENDPOINT.to_string()
        } else if self.server.starts_with("http://") || self.server.starts_with("https://") {
            self.server.clone()
        } else {
            format!("https://{}/EWS/Exchange.asmx", self.server)
        }
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(
            str_prop(obj, TYPE_LABEL, "domain")?,
            str_prop(obj, TYPE_LABEL, "server")?,
            str_prop(obj, TYPE_LABEL, "admin_user")?,
            str_prop(obj, TYPE_LABEL, "admin_password")?,
            str_prop(obj, TYPE_LABEL, "user")?,
        )))
    }
}

impl fmt::Debug for EwsAccountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EwsAccountSource({}, {}, {}, ****, {})",
            self.domain, self.server, self.admin_user, self.user
        )
    }
}

/// Failure of one SOAP exchange.
#[derive(Debug)]
enum SoapError {
    /// The server asked us to slow down.
    Busy(String),
    Failed(String),
}

impl fmt::Display for SoapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoapError::Busy(detail) => write!(f, "server busy: {}", detail),
            SoapError::Failed(detail) => f.write_str(detail),
        }
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// An authenticated, impersonating EWS connection for one mailbox.
struct Session {
    client: Client,
    endpoint: String,
    admin_user: String,
    admin_password: String,
    mailbox: String,
    backoff: BackoffParams,
}

#[derive(Debug, Clone)]
struct FolderInfo {
    id: String,
    class: String,
    total: u64,
}

#[derive(Debug, Clone)]
struct MessageInfo {
    id: String,
    subject: String,
}

impl Session {
    fn envelope(&self, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
    xmlns:t="http://schemas.microsoft.com/exchange/services/2006/types"
    xmlns:m="http://schemas.microsoft.com/exchange/services/2006/messages">
  <soap:Header>
    <t:RequestServerVersion Version="Exchange2013"/>
    <t:ExchangeImpersonation>
      <t:ConnectingSID><t:PrimarySmtpAddress>{mailbox}</t:PrimarySmtpAddress></t:ConnectingSID>
    </t:ExchangeImpersonation>
  </soap:Header>
  <soap:Body>{body}</soap:Body>
</soap:Envelope>"#,
            mailbox = escape_xml(&self.mailbox),
            body = body
        )
    }

    fn post_once(&self, body: &str) -> std::result::Result<String, SoapError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.admin_user, Some(&self.admin_password))
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(self.envelope(body))
            .send()
            .map_err(|e| SoapError::Failed(e.to_string()))?;
        let status = response.status();
        let text = response.text().map_err(|e| SoapError::Failed(e.to_string()))?;
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SoapError::Busy(status.to_string()));
        }
        if let Some(code) = RESPONSE_CODE.captures(&text).map(|c| c[1].to_string()) {
            match code.as_str() {
                "NoError" => {}
                "ErrorServerBusy" | "ErrorTooManyObjectsOpened" => return Err(SoapError::Busy(code)),
                _ => return Err(SoapError::Failed(code)),
            }
        }
        if !status.is_success() {
            return Err(SoapError::Failed(status.to_string()));
        }
        Ok(text)
    }

    fn post(&self, body: &str) -> Result<String> {
        run_with_backoff(
            || self.post_once(body),
            |e| matches!(e, SoapError::Busy(_)),
            &self.backoff,
        )
        .map(|(text, _)| text)
        .map_err(|e| EngineError::unavailable(&self.mailbox, e))
    }

    fn mail_folders(&self) -> Result<Vec<FolderInfo>> {
        let body = format!(
            r#"<m:FindFolder Traversal="Deep">
  <m:FolderShape>
    <t:BaseShape>IdOnly</t:BaseShape>
    <t:AdditionalProperties>
      <t:FieldURI FieldURI="folder:FolderClass"/>
      <t:FieldURI FieldURI="folder:TotalCount"/>
    </t:AdditionalProperties>
  </m:FolderShape>
  <m:ParentFolderIds>
    <t:DistinguishedFolderId Id="msgfolderroot">
      <t:Mailbox><t:EmailAddress>{}</t:EmailAddress></t:Mailbox>
    </t:DistinguishedFolderId>
  </m:ParentFolderIds>
</m:FindFolder>"#,
            escape_xml(&self.mailbox)
        );
        Ok(parse_folders(&self.post(&body)?)
            .into_iter()
            .filter(|f| f.class == "IPF.Note" && f.total > 0)
            .collect())
    }

    /// One page of messages; the flag says whether this was the last page.
    fn messages(&self, folder_id: &str, offset: usize) -> Result<(Vec<MessageInfo>, bool)> {
        let body = format!(
            r#"<m:FindItem Traversal="Shallow">
  <m:ItemShape>
    <t:BaseShape>IdOnly</t:BaseShape>
    <t:AdditionalProperties><t:FieldURI FieldURI="item:Subject"/></t:AdditionalProperties>
  </m:ItemShape>
  <m:IndexedPageItemView MaxEntriesReturned="{}" Offset="{}" BasePoint="Beginning"/>
  <m:ParentFolderIds><t:FolderId Id="{}"/></m:ParentFolderIds>
</m:FindItem>"#,
            PAGE_SIZE,
            offset,
            escape_xml(folder_id)
        );
        let text = self.post(&body)?;
        let messages = parse_messages(&text);
        let last = LAST_IN_RANGE
            .captures(&text)
            .map(|c| &c[1] == "true")
            .unwrap_or(messages.len() < PAGE_SIZE);
        Ok((messages, last))
    }

    fn message(&self, item_id: &str) -> Result<Message> {
        let body = format!(
            r#"<m:GetItem>
  <m:ItemShape>
    <t:BaseShape>IdOnly</t:BaseShape>
    <t:IncludeMimeContent>true</t:IncludeMimeContent>
    <t:AdditionalProperties>
      <t:FieldURI FieldURI="item:DateTimeReceived"/>
      <t:FieldURI FieldURI="item:Size"/>
    </t:AdditionalProperties>
  </m:ItemShape>
  <m:ItemIds><t:ItemId Id="{}"/></m:ItemIds>
</m:GetItem>"#,
            escape_xml(item_id)
        );
        parse_message(&self.post(&body)?).ok_or_else(|| EngineError::unavailable(item_id, "no MIME content returned"))
    }
}

fn parse_folders(text: &str) -> Vec<FolderInfo> {
    FOLDER_BLOCK
        .captures_iter(text)
        .filter_map(|block| {
            let inner = &block[1];
            Some(FolderInfo {
                id: FOLDER_ID.captures(inner)?[1].to_string(),
                class: FOLDER_CLASS
                    .captures(inner)
                    .map(|c| c[1].to_string())
                    .unwrap_or_default(),
                total: TOTAL_COUNT
                    .captures(inner)
                    .and_then(|c| c[1].parse().ok())
                    .unwrap_or(0),
            })
        })
        .collect()
}

fn parse_messages(text: &str) -> Vec<MessageInfo> {
    MESSAGE_BLOCK
        .captures_iter(text)
        .filter_map(|block| {
            let inner = &block[1];
            Some(MessageInfo {
                id: ITEM_ID.captures(inner)?[1].to_string(),
                subject: SUBJECT
                    .captures(inner)
                    .map(|c| unescape_xml(&c[1]))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

struct Message {
    mime: Vec<u8>,
    received: Option<DateTime<Utc>>,
    size: Option<u64>,
}

fn parse_message(text: &str) -> Option<Message> {
    let encoded: String = MIME_CONTENT
        .captures(text)?[1]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    Some(Message {
        mime: BASE64.decode(encoded).ok()?,
        received: RECEIVED
            .captures(text)
            .and_then(|c| DateTime::parse_from_rfc3339(&c[1]).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        size: SIZE.captures(text).and_then(|c| c[1].parse().ok()),
    })
}

impl Source for EwsAccountSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("domain".to_string(), Value::String(self.domain.clone()));
        props.insert("server".to_string(), Value::String(self.server.clone()));
        props.insert("admin_user".to_string(), Value::String(self.admin_user.clone()));
        props.insert("admin_password".to_string(), Value::String(self.admin_password.clone()));
        props.insert("user".to_string(), Value::String(self.user.clone()));
        props
    }

    fn open(&self, sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::unavailable(self.address(), e))?;
        let session = Session {
            client,
            endpoint: self.endpoint(),
            admin_user: self.admin_user.clone(),
            admin_password: self.admin_password.clone(),
            mailbox: self.address(),
            backoff: sm.backoff().clone(),
        };
        Ok(OpenState::new(Cookie::local(session)).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self;
        let session = sm.open_as::<Session>(&this)?;
        let folders = session.mail_folders()?;
        debug!(mailbox = %session.mailbox, folders = folders.len(), "Enumerating mailbox");
        Ok(Box::new(MailboxWalk {
            this,
            session,
            folders: folders.into_iter(),
            current: None,
            page: Vec::new().into_iter(),
        }))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        let session = sm.open_as::<Session>(handle.source())?;
        let (_, item_id) = handle
            .relative_path()
            .split_once('.')
            .ok_or_else(|| EngineError::malformed(TYPE_LABEL, "mail path is not folder.item"))?;
        Ok(Box::new(EwsMailResource {
            handle: handle.clone(),
            item_id: item_id.to_string(),
            session,
            message: OnceCell::new(),
            cache: MetadataCache::default(),
        }))
    }

    fn censor(&self) -> Option<SourceRef> {
        Some(Arc::new(Self {
            admin_user: String::new(),
            admin_password: String::new(),
            ..self.clone()
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Walks the mailbox's mail folders, one FindItem page at a time.
struct MailboxWalk {
    this: SourceRef,
    session: Arc<Session>,
    folders: std::vec::IntoIter<FolderInfo>,
    /// Folder being paged, with the next offset (None once exhausted).
    current: Option<(FolderInfo, Option<usize>)>,
    page: std::vec::IntoIter<MessageInfo>,
}

impl Iterator for MailboxWalk {
    type Item = Result<Handle>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.page.next() {
                let folder_id = self.current.as_ref().map(|(f, _)| f.id.as_str()).unwrap_or("");
                let handle = Handle::new(Arc::clone(&self.this), format!("{}.{}", folder_id, message.id))
                    .with_mime(MAIL_MIME)
                    .with_title(message.subject);
                return Some(Ok(handle));
            }
            match self.current.take() {
                Some((folder, Some(offset))) => match self.session.messages(&folder.id, offset) {
                    Ok((messages, last)) => {
                        let next = if last || messages.is_empty() {
                            None
                        } else {
                            Some(offset + messages.len())
                        };
                        self.page = messages.into_iter();
                        self.current = Some((folder, next));
                    }
                    Err(err) => return Some(Err(err)),
                },
                _ => {
                    let folder = self.folders.next()?;
                    self.current = Some((folder, Some(0)));
                }
            }
        }
    }
}

struct EwsMailResource {
    handle: Handle,
    item_id: String,
    session: Arc<Session>,
    message: OnceCell<Message>,
    cache: MetadataCache,
}

impl EwsMailResource {
    fn message(&self) -> Result<&Message> {
        self.message.get_or_try_init(|| self.session.message(&self.item_id))
    }
}

impl Resource for EwsMailResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.message()?.mime.as_slice())))
    }

    fn fetch_size(&self) -> Result<u64> {
        let message = self.message()?;
        Ok(message.size.unwrap_or(message.mime.len() as u64))
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.message()?.received)
    }

    fn fetch_type(&self) -> Result<String> {
        Ok(MAIL_MIME.to_string())
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_type(TYPE_LABEL, EwsAccountSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_and_censor() {
        let registry = SourceRegistry::builtin().unwrap();
        let source: SourceRef = Arc::new(EwsAccountSource::new("example.org", "", "svc", "hunter2", "alice"));
        assert_eq!(*registry.from_json(&source.to_json_object()).unwrap(), *source);
        let censored = source.censor().unwrap().to_json_object();
        assert_eq!(censored["admin_password"], "");
        assert!(!format!("{:?}", source).contains("hunter2"));
    }

    #[test]
    fn test_endpoint_defaults_to_office365() {
        let source = EwsAccountSource::new("example.org", "", "svc", "pw", "alice");
        assert_eq!(source.endpoint(), OFFICE_365_ENDPOINT);
        let onprem = EwsAccountSource::new("example.org", "mail.example.org", "svc", "pw", "alice");
        assert_eq!(onprem.endpoint(), "https://mail.example.org/EWS/Exchange.asmx");
    }

    #[test]
    fn test_parse_find_folder_response() {
        let xml = r#"<m:Folders>
            <t:Folder><t:FolderId Id="AAA=" ChangeKey="x"/><t:FolderClass>IPF.Note</t:FolderClass><t:TotalCount>3</t:TotalCount></t:Folder>
            <t:Folder><t:FolderId Id="BBB=" ChangeKey="y"/><t:FolderClass>IPF.Appointment</t:FolderClass><t:TotalCount>9</t:TotalCount></t:Folder>
        </m:Folders>"#;
        let folders = parse_folders(xml);
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].id, "AAA=");
        assert_eq!(folders[0].class, "IPF.Note");
        assert_eq!(folders[1].total, 9);
    }

    #[test]
    fn test_parse_find_item_response() {
        let xml = r#"<m:RootFolder IncludesLastItemInRange="true"><t:Items>
            <t:Message><t:ItemId Id="M1" ChangeKey="c"/><t:Subject>Salary &amp; bonus</t:Subject></t:Message>
        </t:Items></m:RootFolder>"#;
        let messages = parse_messages(xml);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "M1");
        assert_eq!(messages[0].subject, "Salary & bonus");
    }

    #[test]
    fn test_parse_get_item_response() {
        let xml = r#"<t:Message><t:MimeContent CharacterSet="UTF-8">U3ViamVjdDogaGkKCmJvZHk=</t:MimeContent>
            <t:DateTimeReceived>2024-03-01T09:30:00Z</t:DateTimeReceived><t:Size>1234</t:Size></t:Message>"#;
        let message = parse_message(xml).unwrap();
        assert_eq!(message.mime, b"Subject: hi\n\nbody");
        assert_eq!(message.size, Some(1234));
        assert_eq!(message.received.unwrap().to_rfc3339(), "2024-03-01T09:30:00+00:00");
    }
}
