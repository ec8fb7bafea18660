//! Text extraction: plain text, HTML and OCR of images.

use super::{ConversionRegistry, OutputType, OutputValue};
use crate::error::Result;
use crate::model::Resource;
use crate::subprocess;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::ffi::OsStr;
use tempfile::TempDir;
use tracing::debug;

static SCRIPT_OR_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("static regex"));
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));
static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);").expect("static regex"));

/// Named references for U+00A0 to U+00FF, in code point order.
const LATIN1_ENTITIES: [&str; 96] = [
    "nbsp", "iexcl", "cent", "pound", "curren", "yen", "brvbar", "sect",
    "uml", "copy", "ordf", "laquo", "not", "shy", "reg", "macr",
    "deg", "plusmn", "sup2", "sup3", "acute", "micro", "para", "middot",
    "cedil", "sup1", "ordm", "raquo", "frac14", "frac12", "frac34", "iquest",
    "Agrave", "Aacute", "Acirc", "Atilde", "Auml", "Aring", "AElig", "Ccedil",
    "Egrave", "Eacute", "Ecirc", "Euml", "Igrave", "Iacute", "Icirc", "Iuml",
    "ETH", "Ntilde", "Ograve", "Oacute", "Ocirc", "Otilde", "Ouml", "times",
    "Oslash", "Ugrave", "Uacute", "Ucirc", "Uuml", "Yacute", "THORN", "szlig",
    "agrave", "aacute", "acirc", "atilde", "auml", "aring", "aelig", "ccedil",
    "egrave", "eacute", "ecirc", "euml", "igrave", "iacute", "icirc", "iuml",
    "eth", "ntilde", "ograve", "oacute", "ocirc", "otilde", "ouml", "divide",
    "oslash", "ugrave", "uacute", "ucirc", "uuml", "yacute", "thorn", "yuml",
];

static NAMED_ENTITIES: Lazy<HashMap<&'static str, char>> = Lazy::new(|| {
    let mut named: HashMap<&'static str, char> = LATIN1_ENTITIES
        .iter()
        .zip('\u{a0}'..='\u{ff}')
        .map(|(name, ch)| (*name, ch))
        .collect();
    named.extend([
        ("amp", '&'),
        ("lt", '<'),
        ("gt", '>'),
        ("quot", '"'),
        ("apos", '\''),
        ("OElig", '\u{152}'),
        ("oelig", '\u{153}'),
        ("Scaron", '\u{160}'),
        ("scaron", '\u{161}'),
        ("Yuml", '\u{178}'),
        ("ensp", '\u{2002}'),
        ("emsp", '\u{2003}'),
        ("thinsp", '\u{2009}'),
        ("ndash", '\u{2013}'),
        ("mdash", '\u{2014}'),
        ("lsquo", '\u{2018}'),
        ("rsquo", '\u{2019}'),
        ("sbquo", '\u{201a}'),
        ("ldquo", '\u{201c}'),
        ("rdquo", '\u{201d}'),
        ("bdquo", '\u{201e}'),
        ("dagger", '\u{2020}'),
        ("Dagger", '\u{2021}'),
        ("bull", '\u{2022}'),
        ("hellip", '\u{2026}'),
        ("permil", '\u{2030}'),
        ("lsaquo", '\u{2039}'),
        ("rsaquo", '\u{203a}'),
        ("euro", '\u{20ac}'),
        ("trade", '\u{2122}'),
    ]);
    named
});

fn decode_entity(body: &str) -> Option<String> {
    let ch = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
    } else if let Some(dec) = body.strip_prefix('#') {
        char::from_u32(dec.parse().ok()?)?
    } else {
        *NAMED_ENTITIES.get(body)?
    };
    Some(ch.to_string())
}

/// The text content of an HTML document: markup, comments, scripts and
/// stylesheets removed, character references decoded.
pub fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, "");
    let without_comments = COMMENT.replace_all(&without_code, "");
    let without_tags = TAG.replace_all(&without_comments, "");
    ENTITY
        .replace_all(&without_tags, |caps: &Captures<'_>| {
            decode_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn plain_text(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    match String::from_utf8(resource.read_all()?) {
        Ok(text) => Ok(Some(OutputValue::Text(text))),
        Err(_) => {
            debug!(handle = %resource.handle(), "Content is not valid UTF-8");
            Ok(None)
        }
    }
}

fn html(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    let bytes = resource.read_all()?;
    Ok(Some(OutputValue::Text(html_to_text(&String::from_utf8_lossy(&bytes)))))
}

fn tesseract(path: &OsStr, what: &str) -> Result<String> {
    let output = subprocess::run("tesseract", [path, OsStr::new("stdout")], what)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn ocr(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    let path = resource.make_path()?;
    let text = tesseract(path.as_os_str(), &resource.handle().to_string())?;
    Ok(Some(OutputValue::Text(text)))
}

/// GIF and BMP images are turned into PNG by ImageMagick first; tesseract
/// reads them poorly.
fn ocr_via_png(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    let what = resource.handle().to_string();
    let path = resource.make_path()?;
    let scratch = TempDir::new()?;
    let png = scratch.path().join("page.png");
    let mut target = std::ffi::OsString::from("png:");
    target.push(&png);
    subprocess::run("convert", [path.as_os_str(), target.as_os_str()], &what)?;
    Ok(Some(OutputValue::Text(tesseract(png.as_os_str(), &what)?)))
}

pub(super) fn register(registry: &mut ConversionRegistry) -> Result<()> {
    registry.register(OutputType::Text, &["text/plain"], plain_text)?;
    registry.register(OutputType::Text, &["text/html"], html)?;
    registry.register(OutputType::Text, &["image/png", "image/jpeg"], ocr)?;
    registry.register(OutputType::Text, &["image/gif", "image/x-ms-bmp"], ocr_via_png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::data::DataSource;
    use crate::model::{Handle, SourceManager, SourceRef};
    use std::sync::Arc;

    #[test]
    fn test_html_to_text() {
        let page = "<html><head><style>p { color: red }</style>\
                    <script>var cpr = '1111111118';</script></head>\
                    <body><!-- note --><p>Blåbær &amp; fl&oslash;de</p><p>&#65;&#x42;</p></body></html>";
        assert_eq!(html_to_text(page), "Blåbær & flødeAB");
    }

    #[test]
    fn test_latin1_and_typographic_entities() {
        assert_eq!(
            html_to_text("&Aring;rhus &eacute;t caf&eacute; &frac12; &ndash; &euro;5 &copy;"),
            "Århus ét café ½ – €5 ©"
        );
        assert_eq!(html_to_text("&nbsp;&yuml;"), "\u{a0}ÿ");
    }

    #[test]
    fn test_unknown_entity_is_kept() {
        assert_eq!(html_to_text("a &bogus; b"), "a &bogus; b");
    }

    #[test]
    fn test_invalid_utf8_gives_nothing() {
        let source: SourceRef = Arc::new(DataSource::new(vec![0xff, 0xfe, 0x41], "text/plain"));
        let mut sm = SourceManager::new();
        let resource = Handle::new(source, "file").follow(&mut sm).unwrap();
        assert_eq!(plain_text(resource.as_ref()).unwrap(), None);
    }
}
