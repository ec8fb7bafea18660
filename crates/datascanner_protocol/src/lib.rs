//! Wire contract of the datascanner pipeline
//!
//! Stages talk only through named queues, and each queue carries exactly
//! one message shape:
//!
//! ```text
//! os2ds_sources          ScanSpec               explorer <- submit, processor
//! os2ds_conversions      ConversionMessage      processor <- explorer, matcher
//! os2ds_representations  RepresentationMessage  matcher <- processor
//! os2ds_matches          MatchesMessage         exporter <- matcher
//! os2ds_handles          HandleMessage          tagger <- matcher
//! os2ds_metadata         MetadataMessage        exporter <- tagger
//! os2ds_problems         ProblemMessage         exporter <- any stage
//! ```
//!
//! Bodies are JSON. Delivery is at least once, so every consumer must
//! tolerate duplicates.

pub mod defaults;
mod error;
pub mod messages;
pub mod paths;
pub mod queues;

pub use error::{ProtocolError, Result};
pub use messages::{
    ConversionMessage, HandleMessage, MatchFragment, MatchesMessage, Message, MetadataMessage,
    ProblemKind, ProblemMessage, Progress, RepresentationMessage, ScanSpec, ScanTag,
};
pub use queues::Queue;
