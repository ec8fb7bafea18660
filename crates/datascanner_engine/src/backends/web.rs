//! Web sites, explored by following same-site links from a root URL.

use crate::error::{EngineError, Result};
use crate::model::source::str_prop;
use crate::model::{
    Cookie, Handle, HandleIter, MetadataCache, OpenState, Resource, Source, SourceManager, SourceRef,
    SourceRegistry, SourceState, OCTET_STREAM,
};
use chrono::{DateTime, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const TYPE_LABEL: &str = "web";

/// Pages fetched per crawl before giving up on finding more.
const MAX_CRAWL_PAGES: usize = 10_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"'#]+)"#).expect("valid href regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSource {
    url: String,
}

impl WebSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| EngineError::malformed(TYPE_LABEL, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::malformed(TYPE_LABEL, format!("not a web URL: {}", url)));
        }
        Ok(Self { url })
    }

    pub fn from_url(url: &str) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(url)?))
    }

    fn from_json(obj: &Map<String, Value>, _: &SourceRegistry) -> Result<SourceRef> {
        Self::from_url(str_prop(obj, TYPE_LABEL, "url")?)
    }

    /// Absolute URL of a Handle relative to this Source.
    fn resolve(&self, relative: &str) -> String {
        format!("{}{}", self.url, relative)
    }

    /// Maps an absolute URL back to a relative path, if it lies under this
    /// Source's root.
    fn relativise(&self, absolute: &Url) -> Option<String> {
        let mut absolute = absolute.clone();
        absolute.set_fragment(None);
        absolute.as_str().strip_prefix(&self.url).map(str::to_string)
    }
}

fn fetch(client: &Client, url: &str, head: bool) -> Result<Response> {
    let request = if head { client.head(url) } else { client.get(url) };
    request
        .send()
        .and_then(Response::error_for_status)
        .map_err(|e| EngineError::unavailable(url, e))
}

fn header_str(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

impl Source for WebSource {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn handle_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("url".to_string(), Value::String(self.url.clone()));
        props
    }

    fn open(&self, _sm: &mut SourceManager) -> Result<Box<dyn SourceState>> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::unavailable(&self.url, e))?;
        Ok(OpenState::new(Cookie::local(client)).boxed())
    }

    fn handles(self: Arc<Self>, sm: &mut SourceManager) -> Result<HandleIter> {
        let this: SourceRef = self.clone();
        let client = sm.open_as::<Client>(&this)?;
        Ok(Box::new(Crawl {
            source: self,
            this,
            client,
            queue: VecDeque::from([String::new()]),
            seen: HashSet::from([String::new()]),
            fetched: 0,
        }))
    }

    fn follow(&self, handle: &Handle, sm: &mut SourceManager) -> Result<Box<dyn Resource>> {
        let client = sm.open_as::<Client>(handle.source())?;
        Ok(Box::new(WebResource {
            handle: handle.clone(),
            url: self.resolve(handle.relative_path()),
            client,
            head: OnceCell::new(),
            cache: MetadataCache::default(),
        }))
    }

    fn to_url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Breadth-first walk over the pages below the root URL. Every distinct
/// address is yielded once; only HTML pages are read for further links.
struct Crawl {
    source: Arc<WebSource>,
    this: SourceRef,
    client: Arc<Client>,
    queue: VecDeque<String>,
    seen: HashSet<String>,
    fetched: usize,
}

impl Crawl {
    fn discover(&mut self, relative: &str) -> Result<()> {
        if self.fetched >= MAX_CRAWL_PAGES {
            return Ok(());
        }
        let url = self.source.resolve(relative);
        let head = fetch(&self.client, &url, true)?;
        if content_type(&head) != "text/html" {
            return Ok(());
        }
        self.fetched += 1;
        let page_url = Url::parse(&url).map_err(|e| EngineError::unavailable(&url, e))?;
        let body = fetch(&self.client, &url, false)?
            .text()
            .map_err(|e| EngineError::unavailable(&url, e))?;
        for caps in HREF.captures_iter(&body) {
            let Ok(link) = page_url.join(&caps[1]) else {
                continue;
            };
            if let Some(rel) = self.source.relativise(&link) {
                if self.seen.insert(rel.clone()) {
                    self.queue.push_back(rel);
                }
            }
        }
        debug!(url = %url, queued = self.queue.len(), "Crawled page");
        Ok(())
    }
}

impl Iterator for Crawl {
    type Item = Result<Handle>;

    fn next(&mut self) -> Option<Self::Item> {
        let relative = self.queue.pop_front()?;
        let handle = Handle::new(Arc::clone(&self.this), relative.clone());
        Some(self.discover(&relative).map(|_| handle))
    }
}

struct Head {
    mime: String,
    length: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
}

struct WebResource {
    handle: Handle,
    url: String,
    client: Arc<Client>,
    head: OnceCell<Head>,
    cache: MetadataCache,
}

impl WebResource {
    fn head(&self) -> Result<&Head> {
        self.head.get_or_try_init(|| {
            let response = fetch(&self.client, &self.url, true)?;
            Ok(Head {
                mime: content_type(&response),
                length: header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
                last_modified: header_str(&response, LAST_MODIFIED)
                    .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        })
    }
}

impl Resource for WebResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    fn make_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let body = fetch(&self.client, &self.url, false)?
            .bytes()
            .map_err(|e| EngineError::unavailable(&self.url, e))?;
        Ok(Box::new(Cursor::new(body)))
    }

    fn fetch_size(&self) -> Result<u64> {
        match self.head()?.length {
            Some(length) => Ok(length),
            None => Ok(std::io::copy(&mut self.make_stream()?, &mut std::io::sink())?),
        }
    }

    fn fetch_last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.head()?.last_modified)
    }

    fn fetch_type(&self) -> Result<String> {
        Ok(self.head()?.mime.clone())
    }
}

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    registry.register_scheme("http", WebSource::from_url)?;
    registry.register_scheme("https", WebSource::from_url)?;
    registry.register_type(TYPE_LABEL, WebSource::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_round_trip() {
        let registry = SourceRegistry::builtin().unwrap();
        let source = registry.from_url("https://www.example.org/").unwrap();
        assert_eq!(source.type_label(), TYPE_LABEL);
        assert_eq!(source.to_url().unwrap(), "https://www.example.org/");
        assert_eq!(*registry.from_json(&source.to_json_object()).unwrap(), *source);
    }

    #[test]
    fn test_relativise_stays_on_site() {
        let source = WebSource::new("https://www.example.org/docs/").unwrap();
        let inside = Url::parse("https://www.example.org/docs/a/b.html#top").unwrap();
        let outside = Url::parse("https://other.example.org/docs/a.html").unwrap();
        assert_eq!(source.relativise(&inside).as_deref(), Some("a/b.html"));
        assert_eq!(source.relativise(&outside), None);
        assert_eq!(source.resolve("a/b.html"), "https://www.example.org/docs/a/b.html");
    }

    #[test]
    fn test_href_extraction() {
        let html = r##"<p><a class="x" href="one.html">1</a> <A HREF='/docs/two.pdf'>2</A> <a href="#frag">3</a></p>"##;
        let links: Vec<&str> = HREF.captures_iter(html).map(|c| c.get(1).unwrap().as_str()).collect();
        assert_eq!(links, vec!["one.html", "/docs/two.pdf"]);
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(WebSource::new("ftp://example.org/").is_err());
    }
}
