//! Pipeline stages for datascanner
//!
//! Scanning runs as five stages connected by queues:
//!
//! ```text
//! submit -> explorer -> processor -> matcher -> exporter
//!              ^            |           |  \
//!              +- derived --+           |   +-> tagger -> exporter
//!                 sources    <- more ---+
//!                            conversions
//! ```
//!
//! Every stage is a [`stages::Stage`] driven by a [`runner::StageRunner`]
//! against a [`broker::Broker`]: the in-memory broker for tests and
//! single-process runs, or the SQLite one for stages in separate processes.

pub mod broker;
pub mod config;
mod error;
pub mod pipeline;
pub mod runner;
pub mod stages;
pub mod tree;

pub use broker::{Broker, Delivery, MemoryBroker, SqliteBroker};
pub use config::PipelineConfig;
pub use error::{BrokerError, BrokerResult, StageError, StageResult};
pub use pipeline::{Pipeline, StageKind};
pub use runner::{run_until_drained, RunnerStats, StageRunner};
pub use stages::{Stage, StageContext};
