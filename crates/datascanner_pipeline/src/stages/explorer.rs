//! Explorer: Source in, one conversion message per Handle out.

use super::{source_problem, unexpected, Stage, StageContext};
use crate::error::StageResult;
use async_trait::async_trait;
use datascanner_engine::{Engine, SourceManager};
use datascanner_protocol::{ConversionMessage, Message, ProblemKind, ProblemMessage, Queue, ScanSpec};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Explorer {
    ctx: StageContext,
}

impl Explorer {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage for Explorer {
    fn name(&self) -> &'static str {
        "explorer"
    }

    fn consumes(&self) -> &'static [Queue] {
        &[Queue::Sources]
    }

    async fn process(&self, message: Message) -> StageResult<Vec<Message>> {
        let Message::ScanSpec(spec) = message else {
            return Err(unexpected(self.name(), &message));
        };
        self.ctx.blocking(move |engine, sm| explore(engine, sm, &spec)).await
    }
}

fn explore(engine: &Engine, sm: &mut SourceManager, spec: &ScanSpec) -> StageResult<Vec<Message>> {
    // A scan spec that can never work is reported, not retried.
    let source = match engine.sources.from_json(&spec.source) {
        Ok(source) => source,
        Err(err) => {
            warn!(scan_tag = %spec.scan_tag, error = %err, "Unusable source in scan spec");
            let problem = ProblemMessage::new(ProblemKind::Malformed, err.to_string()).with_scan_tag(spec.scan_tag.clone());
            return Ok(vec![problem.into()]);
        }
    };
    if let Err(err) = engine.rules.from_json(&spec.rule) {
        warn!(scan_tag = %spec.scan_tag, error = %err, "Unusable rule in scan spec");
        return Ok(vec![source_problem(&spec.scan_tag, &source, &err)]);
    }

    let handles = match Arc::clone(&source).handles(sm) {
        Ok(handles) => handles,
        Err(err) if err.is_unavailable() => {
            warn!(source = %source, error = %err, "Source unavailable");
            return Ok(vec![source_problem(&spec.scan_tag, &source, &err)]);
        }
        Err(err) => return Err(err.into()),
    };

    let scan_spec = spec.without_progress();
    let progress = spec.initial_progress();
    let mut outputs = Vec::new();
    let mut found = 0usize;
    for handle in handles {
        match handle {
            Ok(handle) => {
                debug!(handle = %handle, "Found handle");
                found += 1;
                outputs.push(
                    ConversionMessage {
                        scan_spec: scan_spec.clone(),
                        handle: handle.to_json_object(),
                        progress: progress.clone(),
                    }
                    .into(),
                );
            }
            // One unreachable entry does not end the exploration.
            Err(err) => {
                warn!(source = %source, error = %err, "Could not enumerate an entry");
                outputs.push(source_problem(&spec.scan_tag, &source, &err));
            }
        }
    }
    info!(source = %source, handles = found, "Exploration finished");
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datascanner_protocol::ScanTag;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn context() -> StageContext {
        StageContext::new(Arc::new(Engine::builtin().unwrap()))
    }

    #[tokio::test]
    async fn test_unknown_source_type_is_a_problem() {
        let spec = ScanSpec::new(ScanTag::new("test"), json!({"type": "gopher"}), json!({"type": "fallback"}));
        let outputs = Explorer::new(context()).process(spec.into()).await.unwrap();
        assert_eq!(outputs.len(), 1);
        let Message::Problem(problem) = &outputs[0] else {
            panic!("expected a problem, got {:?}", outputs[0]);
        };
        assert_eq!(problem.problem, ProblemKind::Malformed);
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("gone");
        let source = json!({"type": "file", "path": gone.to_string_lossy()});
        let spec = ScanSpec::new(ScanTag::new("test"), source, json!({"type": "fallback"}));
        let outputs = Explorer::new(context()).process(spec.into()).await.unwrap();
        assert!(matches!(
            &outputs[..],
            [Message::Problem(ProblemMessage { problem: ProblemKind::Unavailable, .. })]
        ));
    }

    #[tokio::test]
    async fn test_handles_carry_the_initial_progress() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        let source = json!({"type": "file", "path": tmp.path().to_string_lossy()});
        let rule = json!({"type": "regex", "expression": "alpha"});
        let spec = ScanSpec::new(ScanTag::new("test"), source, rule.clone());

        let outputs = Explorer::new(context()).process(spec.into()).await.unwrap();
        let [Message::Conversion(conversion)] = &outputs[..] else {
            panic!("expected one conversion, got {:?}", outputs);
        };
        assert_eq!(conversion.progress.rule, rule);
        assert!(conversion.progress.matches.is_empty());
        assert!(conversion.scan_spec.progress.is_none());
        assert_eq!(conversion.handle["path"], "a.txt");
    }
}
