//! Processor: derives Sources from containers, converts everything else.

use super::{handle_problem, unexpected, Stage, StageContext};
use crate::error::StageResult;
use async_trait::async_trait;
use datascanner_engine::{Engine, SourceManager};
use datascanner_protocol::{ConversionMessage, Message, Queue, RepresentationMessage};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub struct Processor {
    ctx: StageContext,
}

impl Processor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage for Processor {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn consumes(&self) -> &'static [Queue] {
        &[Queue::Conversions]
    }

    async fn process(&self, message: Message) -> StageResult<Vec<Message>> {
        let Message::Conversion(conversion) = message else {
            return Err(unexpected(self.name(), &message));
        };
        self.ctx.blocking(move |engine, sm| convert(engine, sm, conversion)).await
    }
}

fn convert(engine: &Engine, sm: &mut SourceManager, conversion: ConversionMessage) -> StageResult<Vec<Message>> {
    let scan_tag = conversion.scan_spec.scan_tag.clone();
    let handle = engine.sources.handle_from_json(&conversion.handle)?;
    let rule = engine.rules.from_json(&conversion.progress.rule)?;
    let output = rule.split()?.operates_on();

    let resource = match handle.follow(sm) {
        Ok(resource) => resource,
        Err(err) if err.is_unavailable() => {
            warn!(handle = %handle, error = %err, "Handle unavailable");
            return Ok(vec![handle_problem(&scan_tag, &handle, &err)]);
        }
        Err(err) => return Err(err.into()),
    };
    let mime = match resource.compute_type() {
        Ok(mime) => mime,
        Err(err) if err.is_unavailable() => {
            warn!(handle = %handle, error = %err, "Could not read handle");
            return Ok(vec![handle_problem(&scan_tag, &handle, &err)]);
        }
        Err(err) => return Err(err.into()),
    };

    // Containers go back to the explorer as Sources of their own.
    if let Some(derived) = engine.sources.from_handle_with_type(&handle, &mime)? {
        debug!(handle = %handle, source = %derived, "Derived source");
        let spec = conversion
            .scan_spec
            .derive(derived.to_json_object(), conversion.progress);
        return Ok(vec![spec.into()]);
    }

    let mut outputs = Vec::with_capacity(2);
    let value = match engine.conversions.convert(resource.as_ref(), output, Some(&mime)) {
        Ok(Some(value)) => output.encode(&value)?,
        Ok(None) => {
            debug!(handle = %handle, output = %output, mime = %mime, "Conversion produced nothing");
            Value::Null
        }
        // Recorded as attempted, so the matcher does not ask again.
        Err(err) if err.is_unavailable() => {
            warn!(handle = %handle, output = %output, error = %err, "Conversion failed");
            outputs.push(handle_problem(&scan_tag, &handle, &err));
            Value::Null
        }
        Err(err) => return Err(err.into()),
    };

    let mut representations = Map::new();
    representations.insert(output.as_str().to_string(), value);
    outputs.insert(0, RepresentationMessage::new(conversion, representations).into());
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datascanner_engine::model::Handle;
    use datascanner_engine::SourceRef;
    use datascanner_protocol::{ProblemKind, Progress, ScanSpec, ScanTag};
    use serde_json::json;
    use std::fs::{self, File};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context() -> StageContext {
        StageContext::new(Arc::new(Engine::builtin().unwrap()))
    }

    fn conversion_for(root: &std::path::Path, name: &str, rule: Value) -> Message {
        let engine = Engine::builtin().unwrap();
        let source: SourceRef = engine
            .sources
            .from_json(&json!({"type": "file", "path": root.to_string_lossy()}))
            .unwrap();
        let spec = ScanSpec::new(ScanTag::new("test"), source.to_json_object(), rule.clone());
        ConversionMessage {
            scan_spec: spec,
            handle: Handle::new(source, name).to_json_object(),
            progress: Progress::start(rule),
        }
        .into()
    }

    #[tokio::test]
    async fn test_text_is_converted_for_the_head_rule() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("note.txt"), "call 12345678").unwrap();
        let message = conversion_for(tmp.path(), "note.txt", json!({"type": "regex", "expression": "\\d+"}));

        let outputs = Processor::new(context()).process(message).await.unwrap();
        let [Message::Representation(rep)] = &outputs[..] else {
            panic!("expected a representation, got {:?}", outputs);
        };
        assert_eq!(rep.representations["text"], json!("call 12345678"));
    }

    #[tokio::test]
    async fn test_missing_conversion_is_published_as_null() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("note.txt"), "plain").unwrap();
        let message = conversion_for(tmp.path(), "note.txt", json!({"type": "dimensions", "width": [1, 10]}));

        let outputs = Processor::new(context()).process(message).await.unwrap();
        let [Message::Representation(rep)] = &outputs[..] else {
            panic!("expected a representation, got {:?}", outputs);
        };
        assert_eq!(rep.representations["image-dimensions"], Value::Null);
    }

    #[tokio::test]
    async fn test_zip_becomes_a_derived_scan_spec() {
        let tmp = TempDir::new().unwrap();
        let mut zip = ::zip::ZipWriter::new(File::create(tmp.path().join("bundle.zip")).unwrap());
        zip.start_file("inner.txt", ::zip::write::FileOptions::default()).unwrap();
        zip.write_all(b"inside").unwrap();
        zip.finish().unwrap();
        let message = conversion_for(tmp.path(), "bundle.zip", json!({"type": "fallback"}));

        let outputs = Processor::new(context()).process(message).await.unwrap();
        let [Message::ScanSpec(spec)] = &outputs[..] else {
            panic!("expected a scan spec, got {:?}", outputs);
        };
        assert_eq!(spec.source["type"], "zip");
        assert_eq!(spec.progress.as_ref().unwrap().rule, json!({"type": "fallback"}));
    }

    #[tokio::test]
    async fn test_vanished_file_is_a_problem() {
        let tmp = TempDir::new().unwrap();
        let message = conversion_for(tmp.path(), "deleted.txt", json!({"type": "regex", "expression": "x"}));

        let outputs = Processor::new(context()).process(message).await.unwrap();
        let [Message::Problem(problem)] = &outputs[..] else {
            panic!("expected a problem, got {:?}", outputs);
        };
        assert_eq!(problem.problem, ProblemKind::Unavailable);
        assert!(problem.handle.is_some());
    }
}
