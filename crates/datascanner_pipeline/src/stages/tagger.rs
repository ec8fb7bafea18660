//! Tagger: best-effort responsible-party metadata for matched Handles.

use super::{unexpected, Stage, StageContext};
use crate::error::StageResult;
use async_trait::async_trait;
use datascanner_engine::metadata::guess_responsible_party;
use datascanner_protocol::{HandleMessage, Message, MetadataMessage, Queue};
use tracing::{debug, warn};

pub struct Tagger {
    ctx: StageContext,
}

impl Tagger {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage for Tagger {
    fn name(&self) -> &'static str {
        "tagger"
    }

    fn consumes(&self) -> &'static [Queue] {
        &[Queue::Handles]
    }

    async fn process(&self, message: Message) -> StageResult<Vec<Message>> {
        let Message::Handle(HandleMessage { scan_tag, handle }) = message else {
            return Err(unexpected(self.name(), &message));
        };
        self.ctx
            .blocking(move |engine, sm| {
                let parsed = engine.sources.handle_from_json(&handle)?;
                match guess_responsible_party(&parsed, sm) {
                    Ok(metadata) => {
                        debug!(handle = %parsed, guesses = metadata.len(), "Tagged handle");
                        Ok(vec![MetadataMessage {
                            scan_tag,
                            handle,
                            metadata,
                        }
                        .into()])
                    }
                    Err(err) => {
                        warn!(handle = %parsed, error = %err, "Could not collect metadata");
                        Ok(Vec::new())
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datascanner_engine::Engine;
    use datascanner_protocol::ScanTag;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tagger() -> Tagger {
        Tagger::new(StageContext::new(Arc::new(Engine::builtin().unwrap())))
    }

    fn handle_in(root: &std::path::Path, name: &str) -> Message {
        HandleMessage {
            scan_tag: ScanTag::new("test"),
            handle: json!({"type": "file", "path": name, "source": {"type": "file", "path": root.to_string_lossy()}}),
        }
        .into()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_of_a_local_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mine.txt"), "x").unwrap();
        let outputs = tagger().process(handle_in(tmp.path(), "mine.txt")).await.unwrap();
        let [Message::Metadata(metadata)] = &outputs[..] else {
            panic!("unexpected outputs {:?}", outputs);
        };
        assert!(metadata.metadata.contains_key("filesystem-owner-uid"));
    }

    #[tokio::test]
    async fn test_unreachable_handle_is_swallowed() {
        let tmp = TempDir::new().unwrap();
        let outputs = tagger().process(handle_in(tmp.path(), "gone.txt")).await.unwrap();
        assert!(outputs.is_empty());
    }
}
