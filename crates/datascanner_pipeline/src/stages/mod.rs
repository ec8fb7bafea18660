//! The five pipeline stages.
//!
//! A stage turns one decoded message into the messages it publishes. It
//! never touches the broker itself: the [`StageRunner`](crate::runner::StageRunner)
//! publishes the outputs and only then acknowledges the input, so a stage
//! that fails part way leaves nothing acknowledged.

mod explorer;
mod exporter;
mod matcher;
mod processor;
mod tagger;

pub use explorer::Explorer;
pub use exporter::Exporter;
pub use matcher::Matcher;
pub use processor::Processor;
pub use tagger::Tagger;

use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use datascanner_engine::backoff::BackoffParams;
use datascanner_engine::{Engine, EngineError, SourceManager, SourceRef};
use datascanner_protocol::{Message, ProblemKind, ProblemMessage, Queue, ScanTag};
use std::sync::Arc;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queues this stage takes its input from.
    fn consumes(&self) -> &'static [Queue];

    async fn process(&self, message: Message) -> StageResult<Vec<Message>>;
}

/// What the engine-bound stages share: the registries and the retry
/// policy handed to each SourceManager.
#[derive(Clone)]
pub struct StageContext {
    engine: Arc<Engine>,
    backoff: BackoffParams,
}

impl StageContext {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            backoff: BackoffParams::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffParams) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs `work` on the blocking pool with a fresh SourceManager, which
    /// is torn down before the result is returned.
    pub(crate) async fn blocking<T, F>(&self, work: F) -> StageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Engine, &mut SourceManager) -> StageResult<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let backoff = self.backoff.clone();
        tokio::task::spawn_blocking(move || {
            let mut sm = SourceManager::new().with_backoff(backoff);
            let result = work(&engine, &mut sm);
            sm.clear();
            result
        })
        .await?
    }
}

fn unexpected(stage: &str, message: &Message) -> StageError {
    StageError::malformed(format!("{} does not consume {}", stage, message.queue()))
}

fn problem_kind(err: &EngineError) -> ProblemKind {
    if err.is_malformed() {
        ProblemKind::Malformed
    } else {
        ProblemKind::Unavailable
    }
}

fn source_problem(scan_tag: &ScanTag, source: &SourceRef, err: &EngineError) -> Message {
    ProblemMessage::new(problem_kind(err), err.to_string())
        .with_scan_tag(scan_tag.clone())
        .with_source(datascanner_engine::model::censored(source).to_json_object())
        .into()
}

fn handle_problem(scan_tag: &ScanTag, handle: &datascanner_engine::Handle, err: &EngineError) -> Message {
    ProblemMessage::new(problem_kind(err), err.to_string())
        .with_scan_tag(scan_tag.clone())
        .with_handle(handle.censor().to_json_object())
        .into()
}
