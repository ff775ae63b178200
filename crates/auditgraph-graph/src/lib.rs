//! Regulatory knowledge graph.
//!
//! - `snapshot`: immutable, versioned view with resolution, supersession walks and conflict detection
//! - `store`: `KnowledgeGraph`, lock-free readers over an `ArcSwap`ed snapshot
//! - `loader`: standards catalogues on disk

pub mod loader;
pub mod snapshot;
pub mod store;

pub use loader::{load_standards, StandardsFile};
pub use snapshot::{Edge, GraphConflict, GraphSnapshot};
pub use store::KnowledgeGraph;
