//! datascanner command
//!
//! Usage:
//!     datascanner submit --url file:///srv/share --rule '{"type": "cpr"}'
//!     datascanner explorer            # one stage, until Ctrl-C
//!     datascanner run-all             # every stage until the queues drain
//!     datascanner explore smb://srv/share

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use datascanner_db::ScannerDb;
use datascanner_engine::{Engine, SourceManager};
use datascanner_logging::{init_logging, LogConfig};
use datascanner_pipeline::tree::write_tree;
use datascanner_pipeline::{config, Broker, MemoryBroker, Pipeline, PipelineConfig, SqliteBroker, StageKind};
use datascanner_protocol::defaults::DEFAULT_SCANNER_NAME;
use datascanner_protocol::{ScanSpec, ScanTag};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "datascanner", version, about = "Scan shares, mailboxes and websites for personal data")]
struct Cli {
    /// Configuration file [default: ~/.datascanner/config.toml]
    #[arg(long, global = true, env = "DATASCANNER_CONFIG")]
    config: Option<PathBuf>,

    /// Queue and report database, overriding the configuration
    #[arg(long, global = true, env = "DATASCANNER_DB")]
    db: Option<PathBuf>,

    /// Debug output on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate submitted Sources
    Explorer,
    /// Derive container Sources and convert Handles
    Processor,
    /// Evaluate rules against converted content
    Matcher,
    /// Collect responsible-party metadata for matched Handles
    Tagger,
    /// Store matches, metadata and problems in the report database
    Exporter,
    /// Queue a scan of a Source
    Submit(ScanArgs),
    /// Run every stage in this process until all queues are drained
    RunAll {
        #[command(flatten)]
        scan: OptionalScanArgs,

        /// Keep the queues in memory instead of in the database
        #[arg(long, requires = "url")]
        memory: bool,
    },
    /// Print the Handles of a Source, descending into containers
    Explore {
        /// Source URL (file:, smb:, smbc:, http(s):, data:)
        url: String,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Source URL (file:, smb:, smbc:, http(s):, data:)
    #[arg(long)]
    url: String,

    /// Rule as JSON, or @path to a file holding it
    #[arg(long)]
    rule: String,

    /// Scanner name recorded in the scan tag
    #[arg(long, default_value = DEFAULT_SCANNER_NAME)]
    tag: String,
}

#[derive(Args, Debug)]
struct OptionalScanArgs {
    /// Submit a scan of this Source first
    #[arg(long, requires = "rule")]
    url: Option<String>,

    /// Rule for the submitted scan, as JSON or @path
    #[arg(long, requires = "url")]
    rule: Option<String>,

    #[arg(long, default_value = DEFAULT_SCANNER_NAME)]
    tag: String,
}

impl Command {
    fn stage(&self) -> Option<StageKind> {
        match self {
            Command::Explorer => Some(StageKind::Explorer),
            Command::Processor => Some(StageKind::Processor),
            Command::Matcher => Some(StageKind::Matcher),
            Command::Tagger => Some(StageKind::Tagger),
            Command::Exporter => Some(StageKind::Exporter),
            _ => None,
        }
    }

    fn log_name(&self) -> &'static str {
        match self {
            Command::Submit(_) => "submit",
            Command::RunAll { .. } => "run-all",
            Command::Explore { .. } => "explore",
            stage => stage.stage().map(|kind| kind.as_str()).unwrap_or("datascanner"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(
        LogConfig::new(format!("datascanner-{}", cli.command.log_name()))
            .verbose(cli.verbose)
            .quiet(cli.quiet),
    )?;

    let mut config = config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let engine = Engine::builtin().context("Failed to build the engine registries")?;

    match cli.command {
        Command::Explore { url } => explore(engine, url).await,
        Command::Submit(scan) => {
            let spec = scan_spec(&engine, &scan.url, &scan.rule, &scan.tag)?;
            let pipeline = durable_pipeline(config, engine).await?;
            pipeline.submit(spec.clone()).await?;
            info!(scan_tag = %spec.scan_tag, "Scan submitted");
            println!("{}", spec.scan_tag);
            Ok(())
        }
        Command::RunAll { scan, memory } => {
            let spec = match (&scan.url, &scan.rule) {
                (Some(url), Some(rule)) => Some(scan_spec(&engine, url, rule, &scan.tag)?),
                _ => None,
            };
            let pipeline = if memory {
                let db = open_db(&config).await?;
                let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.requeue_limit));
                Pipeline::new(config, engine, db, broker)
            } else {
                durable_pipeline(config, engine).await?
            };
            if let Some(spec) = spec {
                pipeline.submit(spec.clone()).await?;
                info!(scan_tag = %spec.scan_tag, "Scan submitted");
            }
            let stats = pipeline.run_until_drained().await?;
            for (kind, stats) in StageKind::ALL.iter().zip(&stats) {
                info!(
                    stage = %kind,
                    acked = stats.acked,
                    requeued = stats.requeued,
                    dead_lettered = stats.dead_lettered,
                    published = stats.published,
                    "Stage summary"
                );
            }
            Ok(())
        }
        command => {
            let kind = command.stage().context("not a stage command")?;
            let pipeline = durable_pipeline(config, engine).await?;
            run_stage(&pipeline, kind).await
        }
    }
}

async fn open_db(config: &PipelineConfig) -> Result<ScannerDb> {
    ScannerDb::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

async fn durable_pipeline(config: PipelineConfig, engine: Engine) -> Result<Pipeline> {
    let db = open_db(&config).await?;
    let broker = SqliteBroker::new(db.clone())
        .with_lease(config.lease())
        .with_requeue_limit(config.requeue_limit)
        .with_poll_interval(config.poll_interval());
    Ok(Pipeline::new(config, engine, db, Arc::new(broker)))
}

/// Runs one stage until Ctrl-C.
async fn run_stage(pipeline: &Pipeline, kind: StageKind) -> Result<()> {
    let runner = pipeline.runner(kind);
    info!(runner = runner.id(), "Starting {}", kind);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted; finishing deliveries in flight"),
            Err(err) => warn!(error = %err, "Cannot listen for Ctrl-C; stopping"),
        }
        let _ = shutdown_tx.send(true);
    });

    let stats = runner.run(shutdown_rx).await?;
    info!(acked = stats.acked, dead_lettered = stats.dead_lettered, "Stopped {}", kind);
    Ok(())
}

fn scan_spec(engine: &Engine, url: &str, rule: &str, tag: &str) -> Result<ScanSpec> {
    let source = engine
        .sources
        .from_url(url)
        .with_context(|| format!("Unusable source URL: {}", url))?;

    let rule_text = match rule.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read rule file {}", path))?,
        None => rule.to_string(),
    };
    let rule: Value = serde_json::from_str(&rule_text).context("Rule is not valid JSON")?;
    engine.rules.from_json(&rule).context("Unusable rule")?;

    Ok(ScanSpec::new(ScanTag::new(tag), source.to_json_object(), rule))
}

async fn explore(engine: Engine, url: String) -> Result<()> {
    let source = engine
        .sources
        .from_url(&url)
        .with_context(|| format!("Unusable source URL: {}", url))?;
    let leaves = tokio::task::spawn_blocking(move || {
        let mut sm = SourceManager::new();
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        write_tree(&engine, &source, &mut sm, &mut out)
    })
    .await?
    .with_context(|| format!("Failed to explore {}", url))?;
    info!(leaves, "Exploration finished");
    Ok(())
}
