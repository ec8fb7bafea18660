//! Scanning engine for datascanner
//!
//! This crate holds everything a pipeline stage needs to explore data and
//! evaluate rules against it, without any queueing or persistence:
//!
//! - the Source/Handle/Resource model and the SourceManager that owns
//!   opened backend state
//! - backend Sources (filesystem, SMB, web, Exchange, inline data)
//! - derived Sources for container formats (archives, compressed streams,
//!   PDF, office documents, mail)
//! - the conversion registry and the rule engine
//!
//! # Usage
//!
//! ```rust,ignore
//! use datascanner_engine::{Engine, SourceManager};
//!
//! let engine = Engine::builtin()?;
//! let source = engine.sources.from_url("file:///srv/share")?;
//! let rule = engine.rules.from_json(&serde_json::json!({"type": "cpr"}))?;
//!
//! let mut sm = SourceManager::new();
//! for handle in source.handles(&mut sm)? {
//!     let resource = handle?.follow(&mut sm)?;
//!     let verdict = datascanner_engine::rules::evaluate(&rule, |output| {
//!         engine.conversions.convert(resource.as_ref(), output, None)
//!     })?;
//! }
//! ```

pub mod backends;
pub mod backoff;
pub mod conversions;
pub mod derived;
mod error;
pub mod metadata;
pub mod model;
pub mod rules;
pub mod subprocess;

pub use conversions::{ConversionRegistry, OutputType, OutputValue};
pub use error::{EngineError, Result};
pub use model::{Handle, Resource, Source, SourceManager, SourceRef, SourceRegistry};
pub use rules::{Rule, RuleRegistry};

/// The three registries a stage needs, built once at startup.
pub struct Engine {
    pub sources: SourceRegistry,
    pub conversions: ConversionRegistry,
    pub rules: RuleRegistry,
}

impl Engine {
    /// Every built-in Source, conversion and rule type.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            sources: SourceRegistry::builtin()?,
            conversions: ConversionRegistry::builtin()?,
            rules: RuleRegistry::builtin()?,
        })
    }

    /// Limits how many container levels `from_handle` will descend.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.sources = self.sources.with_max_depth(max_depth);
        self
    }
}
