//! Exporter: censors and persists results.
//!
//! Matches and metadata are upserted by (scan tag, handle), so redelivered
//! messages replace the rows they wrote the first time.

use super::{unexpected, Stage, StageContext};
use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use datascanner_db::ScannerDb;
use datascanner_engine::model::censored;
use datascanner_engine::Engine;
use datascanner_protocol::{Message, Queue};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct Exporter {
    engine: Arc<Engine>,
    db: ScannerDb,
    results_path: Option<PathBuf>,
}

impl Exporter {
    pub fn new(ctx: StageContext, db: ScannerDb) -> Self {
        Self {
            engine: Arc::clone(ctx.engine()),
            db,
            results_path: None,
        }
    }

    /// Also append every exported message, one JSON object per line.
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    fn censor_source(&self, source: &mut Value) {
        match self.engine.sources.from_json(source) {
            Ok(parsed) => *source = censored(&parsed).to_json_object(),
            Err(err) => warn!(error = %err, "Exporting a source that could not be censored"),
        }
    }

    fn censor_handle(&self, handle: &mut Value) {
        match self.engine.sources.handle_from_json(handle) {
            Ok(parsed) => *handle = parsed.censor().to_json_object(),
            Err(err) => warn!(error = %err, "Exporting a handle that could not be censored"),
        }
    }

    fn censor(&self, message: &mut Message) {
        match message {
            Message::Matches(m) => {
                self.censor_source(&mut m.scan_spec.source);
                self.censor_handle(&mut m.handle);
            }
            Message::Metadata(m) => self.censor_handle(&mut m.handle),
            Message::Problem(m) => {
                if let Some(source) = m.source.as_mut() {
                    self.censor_source(source);
                }
                if let Some(handle) = m.handle.as_mut() {
                    self.censor_handle(handle);
                }
            }
            _ => {}
        }
    }

    async fn append_result(&self, body: &Value) -> StageResult<()> {
        let Some(path) = &self.results_path else {
            return Ok(());
        };
        let mut line = body.to_string();
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StageError::transient(format!("{}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StageError::transient(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl Stage for Exporter {
    fn name(&self) -> &'static str {
        "exporter"
    }

    fn consumes(&self) -> &'static [Queue] {
        &Queue::EXPORTED
    }

    async fn process(&self, mut message: Message) -> StageResult<Vec<Message>> {
        self.censor(&mut message);
        let body = message.to_json()?;

        match &message {
            Message::Matches(m) => {
                let handle = m.handle.to_string();
                self.db
                    .upsert_match(&m.scan_spec.scan_tag.key(), &handle, m.matched, &body)
                    .await?;
                debug!(handle = %handle, matched = m.matched, "Exported matches");
            }
            Message::Metadata(m) => {
                let metadata = Value::Object(m.metadata.clone());
                self.db
                    .upsert_metadata(&m.scan_tag.key(), &m.handle.to_string(), &metadata)
                    .await?;
            }
            Message::Problem(m) => {
                let scan_tag = m.scan_tag.as_ref().map(|tag| tag.key());
                let location = m.handle.as_ref().or(m.source.as_ref());
                self.db
                    .record_problem(scan_tag.as_deref(), location, m.problem.as_str(), &body)
                    .await?;
            }
            other => return Err(unexpected(self.name(), other)),
        }

        self.append_result(&body).await?;
        Ok(Vec::new())
    }
}
