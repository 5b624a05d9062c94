//! The capability system (C1-C4): token-based access control with a
//! thread-safe, hierarchical context stack, resource-pattern constraints,
//! token expiration, and the safe-attribute registry (spec §1, §4.1-§4.3).

pub mod context;
pub mod manager;
pub mod pattern;
pub mod registry;
pub mod token;

pub use context::{CapabilityContext, Restriction};
pub use manager::{CapabilityManager, ContextGuard, FlowId};
pub use pattern::ResourcePattern;
pub use registry::{AccessKind, SafeAttributeEntry, SafeAttributeRegistry};
pub use token::{CapabilityToken, TokenSnapshot};
