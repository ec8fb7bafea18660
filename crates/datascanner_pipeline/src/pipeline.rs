//! Wiring of stages, broker and report store from one configuration.

use crate::broker::Broker;
use crate::config::PipelineConfig;
use crate::error::BrokerResult;
use crate::runner::{self, RunnerStats, StageRunner};
use crate::stages::{Explorer, Exporter, Matcher, Processor, Stage, StageContext, Tagger};
use datascanner_db::ScannerDb;
use datascanner_engine::Engine;
use datascanner_protocol::{Message, ScanSpec};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Explorer,
    Processor,
    Matcher,
    Tagger,
    Exporter,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Explorer,
        StageKind::Processor,
        StageKind::Matcher,
        StageKind::Tagger,
        StageKind::Exporter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Explorer => "explorer",
            StageKind::Processor => "processor",
            StageKind::Matcher => "matcher",
            StageKind::Tagger => "tagger",
            StageKind::Exporter => "exporter",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// Everything needed to build stage runners against one broker.
pub struct Pipeline {
    config: PipelineConfig,
    ctx: StageContext,
    db: ScannerDb,
    broker: Arc<dyn Broker>,
}

impl Pipeline {
    /// `db` receives the exporter's reports; `broker` may or may not be
    /// backed by the same database.
    pub fn new(config: PipelineConfig, engine: Engine, db: ScannerDb, broker: Arc<dyn Broker>) -> Self {
        let engine = engine.with_max_depth(config.max_derivation_depth);
        let ctx = StageContext::new(Arc::new(engine)).with_backoff(config.backoff.clone());
        Self {
            config,
            ctx,
            db,
            broker,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn stage(&self, kind: StageKind) -> Arc<dyn Stage> {
        let ctx = self.ctx.clone();
        match kind {
            StageKind::Explorer => Arc::new(Explorer::new(ctx)),
            StageKind::Processor => Arc::new(Processor::new(ctx)),
            StageKind::Matcher => Arc::new(Matcher::new(ctx)),
            StageKind::Tagger => Arc::new(Tagger::new(ctx)),
            StageKind::Exporter => {
                let exporter = Exporter::new(ctx, self.db.clone());
                match &self.config.results_path {
                    Some(path) => Arc::new(exporter.with_results_path(path)),
                    None => Arc::new(exporter),
                }
            }
        }
    }

    pub fn runner(&self, kind: StageKind) -> StageRunner {
        StageRunner::new(self.stage(kind), Arc::clone(&self.broker))
            .with_prefetch(self.config.prefetch)
            .with_poll_interval(self.config.poll_interval())
    }

    /// Queues a scan for the explorer.
    pub async fn submit(&self, spec: ScanSpec) -> BrokerResult<()> {
        self.broker.publish(&Message::ScanSpec(spec)).await
    }

    /// Runs all five stages in this process until every queue is drained.
    pub async fn run_until_drained(&self) -> BrokerResult<Vec<RunnerStats>> {
        let runners = StageKind::ALL.into_iter().map(|kind| self.runner(kind)).collect();
        runner::run_until_drained(Arc::clone(&self.broker), runners, self.config.poll_interval()).await
    }
}
