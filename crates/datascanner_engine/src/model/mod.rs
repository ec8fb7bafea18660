//! The Source/Handle/Resource model and the SourceManager that owns opened
//! state.

pub mod handle;
pub mod manager;
pub mod registry;
pub mod resource;
pub mod source;

pub use handle::{Handle, OCTET_STREAM};
pub use manager::{Cookie, CookieValue, OpenState, ShareableCookie, SourceManager, SourceState};
pub use registry::{SourceRegistry, MAX_DERIVATION_DEPTH};
pub use resource::{sniff_type, MetadataCache, Resource, ScopedPath};
pub use source::{censored, HandleIter, Source, SourceKey, SourceRef};
