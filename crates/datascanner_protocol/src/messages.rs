//! Per-queue message shapes.
//!
//! Sources, Handles and Rules travel as their JSON objects; only the
//! stages that interpret them need the engine's registries. Everything
//! else about a message is typed here and checked when it is decoded.

use crate::error::{ProtocolError, Result};
use crate::queues::Queue;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Shared parts
// ============================================================================

/// Identifies one run of one scanner. Every message produced on behalf of
/// that run, including those for derived Sources, carries the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanTag {
    pub scanner: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organisation: Option<String>,
}

impl ScanTag {
    /// A tag for a run of `scanner` starting now.
    pub fn new(scanner: impl Into<String>) -> Self {
        Self {
            scanner: scanner.into(),
            time: Utc::now().trunc_subsecs(0),
            user: None,
            organisation: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_organisation(mut self, organisation: impl Into<String>) -> Self {
        self.organisation = Some(organisation.into());
        self
    }

    /// Stable text form, used as part of natural keys.
    pub fn key(&self) -> String {
        format!("{}@{}", self.scanner, self.time.to_rfc3339())
    }
}

impl fmt::Display for ScanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// The outcome of evaluating one simple rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFragment {
    pub rule: Value,
    /// `None` when the rule did not match.
    pub matches: Option<Vec<Value>>,
}

/// What is left of a rule for one Handle, and what has fired so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub rule: Value,
    #[serde(default)]
    pub matches: Vec<MatchFragment>,
}

impl Progress {
    pub fn start(rule: Value) -> Self {
        Self {
            rule,
            matches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemKind {
    /// A backend could not be reached or the content could not be read.
    Unavailable,
    /// A message or one of its objects could not be interpreted.
    Malformed,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::Unavailable => "unavailable",
            ProblemKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// `os2ds_sources`: a Source to explore and the rule to run on its Handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub scan_tag: ScanTag,
    pub source: Value,
    pub rule: Value,
    #[serde(default)]
    pub configuration: Map<String, Value>,
    /// Set on scan specs for derived Sources: the rule state carried over
    /// from the Handle the Source was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl ScanSpec {
    pub fn new(scan_tag: ScanTag, source: Value, rule: Value) -> Self {
        Self {
            scan_tag,
            source,
            rule,
            configuration: Map::new(),
            progress: None,
        }
    }

    /// The progress each of this Source's Handles starts from.
    pub fn initial_progress(&self) -> Progress {
        self.progress
            .clone()
            .unwrap_or_else(|| Progress::start(self.rule.clone()))
    }

    /// The same scan, for a Source derived from one of its Handles.
    pub fn derive(&self, source: Value, progress: Progress) -> Self {
        Self {
            scan_tag: self.scan_tag.clone(),
            source,
            rule: self.rule.clone(),
            configuration: self.configuration.clone(),
            progress: Some(progress),
        }
    }

    /// The spec as carried inside other messages, without progress.
    pub fn without_progress(&self) -> Self {
        Self {
            progress: None,
            ..self.clone()
        }
    }
}

/// `os2ds_conversions`: a Handle whose next rule needs a conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionMessage {
    pub scan_spec: ScanSpec,
    pub handle: Value,
    pub progress: Progress,
}

/// `os2ds_representations`: a conversion message plus converted content.
///
/// A key mapped to `null` records that the conversion was attempted and
/// produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentationMessage {
    pub scan_spec: ScanSpec,
    pub handle: Value,
    pub progress: Progress,
    pub representations: Map<String, Value>,
}

impl RepresentationMessage {
    pub fn new(conversion: ConversionMessage, representations: Map<String, Value>) -> Self {
        Self {
            scan_spec: conversion.scan_spec,
            handle: conversion.handle,
            progress: conversion.progress,
            representations,
        }
    }
}

/// `os2ds_matches`: the verdict for one Handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchesMessage {
    pub scan_spec: ScanSpec,
    pub handle: Value,
    pub matched: bool,
    pub matches: Vec<MatchFragment>,
}

/// `os2ds_handles`: a matched Handle to collect metadata for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleMessage {
    pub scan_tag: ScanTag,
    pub handle: Value,
}

/// `os2ds_metadata`: labelled guesses about a Handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMessage {
    pub scan_tag: ScanTag,
    pub handle: Value,
    pub metadata: Map<String, Value>,
}

/// `os2ds_problems`: something went wrong with a Source or a Handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_tag: Option<ScanTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Value>,
    pub problem: ProblemKind,
    #[serde(default)]
    pub extra: Vec<String>,
}

impl ProblemMessage {
    pub fn new(problem: ProblemKind, detail: impl Into<String>) -> Self {
        Self {
            scan_tag: None,
            source: None,
            handle: None,
            problem,
            extra: vec![detail.into()],
        }
    }

    pub fn with_scan_tag(mut self, scan_tag: ScanTag) -> Self {
        self.scan_tag = Some(scan_tag);
        self
    }

    pub fn with_source(mut self, source: Value) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_handle(mut self, handle: Value) -> Self {
        self.handle = Some(handle);
        self
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Any message, tagged by the queue it belongs on.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ScanSpec(ScanSpec),
    Conversion(ConversionMessage),
    Representation(RepresentationMessage),
    Matches(MatchesMessage),
    Handle(HandleMessage),
    Metadata(MetadataMessage),
    Problem(ProblemMessage),
}

impl Message {
    /// The queue this message is published to.
    pub fn queue(&self) -> Queue {
        match self {
            Message::ScanSpec(_) => Queue::Sources,
            Message::Conversion(_) => Queue::Conversions,
            Message::Representation(_) => Queue::Representations,
            Message::Matches(_) => Queue::Matches,
            Message::Handle(_) => Queue::Handles,
            Message::Metadata(_) => Queue::Metadata,
            Message::Problem(_) => Queue::Problems,
        }
    }

    /// Decodes and validates a body taken from `queue`.
    pub fn decode(queue: Queue, body: &[u8]) -> Result<Self> {
        let message = match queue {
            Queue::Sources => Message::ScanSpec(parse(queue, body)?),
            Queue::Conversions => Message::Conversion(parse(queue, body)?),
            Queue::Representations => {
                let message: RepresentationMessage = parse(queue, body)?;
                if message.representations.is_empty() {
                    return Err(ProtocolError::malformed(queue, "no representations"));
                }
                Message::Representation(message)
            }
            Queue::Matches => Message::Matches(parse(queue, body)?),
            Queue::Handles => Message::Handle(parse(queue, body)?),
            Queue::Metadata => Message::Metadata(parse(queue, body)?),
            Queue::Problems => Message::Problem(parse(queue, body)?),
        };
        Ok(message)
    }

    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            Message::ScanSpec(m) => serde_json::to_value(m)?,
            Message::Conversion(m) => serde_json::to_value(m)?,
            Message::Representation(m) => serde_json::to_value(m)?,
            Message::Matches(m) => serde_json::to_value(m)?,
            Message::Handle(m) => serde_json::to_value(m)?,
            Message::Metadata(m) => serde_json::to_value(m)?,
            Message::Problem(m) => serde_json::to_value(m)?,
        };
        Ok(value)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json()?)?)
    }

    /// The scan this message belongs to, when it says.
    pub fn scan_tag(&self) -> Option<&ScanTag> {
        match self {
            Message::ScanSpec(m) => Some(&m.scan_tag),
            Message::Conversion(m) => Some(&m.scan_spec.scan_tag),
            Message::Representation(m) => Some(&m.scan_spec.scan_tag),
            Message::Matches(m) => Some(&m.scan_spec.scan_tag),
            Message::Handle(m) => Some(&m.scan_tag),
            Message::Metadata(m) => Some(&m.scan_tag),
            Message::Problem(m) => m.scan_tag.as_ref(),
        }
    }
}

fn parse<T: DeserializeOwned>(queue: Queue, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::malformed(queue, e.to_string()))
}

macro_rules! message_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(message: $ty) -> Self {
                    Message::$variant(message)
                }
            }
        )*
    };
}

message_from!(
    ScanSpec(ScanSpec),
    Conversion(ConversionMessage),
    Representation(RepresentationMessage),
    Matches(MatchesMessage),
    Handle(HandleMessage),
    Metadata(MetadataMessage),
    Problem(ProblemMessage),
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag() -> ScanTag {
        ScanTag {
            scanner: "nightly".to_string(),
            time: DateTime::parse_from_rfc3339("2024-03-01T12:00:00+00:00")
                .unwrap()
                .with_timezone(&Utc),
            user: None,
            organisation: None,
        }
    }

    #[test]
    fn test_initial_progress_prefers_carried_state() {
        let mut spec = ScanSpec::new(tag(), json!({"type": "file"}), json!({"type": "cpr"}));
        assert_eq!(spec.initial_progress(), Progress::start(json!({"type": "cpr"})));

        let carried = Progress {
            rule: json!({"type": "regex", "expression": "x"}),
            matches: vec![MatchFragment {
                rule: json!({"type": "cpr"}),
                matches: None,
            }],
        };
        spec = spec.derive(json!({"type": "zip"}), carried.clone());
        assert_eq!(spec.initial_progress(), carried);
        assert_eq!(spec.scan_tag, tag());
        assert!(spec.without_progress().progress.is_none());
    }

    #[test]
    fn test_configuration_is_optional() {
        let body = json!({
            "scan_tag": {"scanner": "nightly", "time": "2024-03-01T12:00:00Z"},
            "source": {"type": "file", "path": "/srv"},
            "rule": {"type": "cpr"}
        });
        let message = Message::decode(Queue::Sources, body.to_string().as_bytes()).unwrap();
        let Message::ScanSpec(spec) = message else {
            panic!("expected a scan spec");
        };
        assert!(spec.configuration.is_empty());
        assert!(spec.progress.is_none());
        assert_eq!(spec.scan_tag.key(), "nightly@2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_shape_is_checked_per_queue() {
        let handle = Message::Handle(HandleMessage {
            scan_tag: tag(),
            handle: json!({"type": "file", "path": "a.txt"}),
        });
        let body = handle.encode().unwrap();
        assert_eq!(Message::decode(Queue::Handles, &body).unwrap(), handle);
        assert!(matches!(
            Message::decode(Queue::Matches, &body),
            Err(ProtocolError::Malformed { queue: Queue::Matches, .. })
        ));
    }

    #[test]
    fn test_empty_representation_is_malformed() {
        let body = json!({
            "scan_spec": {"scan_tag": {"scanner": "s", "time": "2024-03-01T12:00:00Z"},
                          "source": {}, "rule": {}},
            "handle": {},
            "progress": {"rule": {}, "matches": []},
            "representations": {}
        });
        assert!(Message::decode(Queue::Representations, body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_problem_shape() {
        let problem = ProblemMessage::new(ProblemKind::Unavailable, "connection refused")
            .with_source(json!({"type": "smb", "unc": "//srv/share"}));
        assert_eq!(
            Message::from(problem).to_json().unwrap(),
            json!({
                "source": {"type": "smb", "unc": "//srv/share"},
                "problem": "unavailable",
                "extra": ["connection refused"]
            })
        );
    }
}
