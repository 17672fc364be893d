//! Multi-dimensional event box tree.
//!
//! Events are stored in leaf boxes; a leaf that grows past the controller's
//! split threshold becomes a grid box of equally sized children. Leaves may
//! spill their events to an [`EventFile`](crate::core::storage::engine::EventFile)
//! through a [`FileBackend`].

pub mod controller;
pub mod event;
pub mod extents;
pub mod file_backing;
pub mod grid_box;
pub mod implicit;
mod ingest;
pub mod md_box;
pub mod node;
mod split;
pub mod tree;

pub use controller::{AddingEventsParameters, BoxController, MAX_CHILDREN_PER_GRID, MAX_DEPTH};
pub use event::MdEvent;
pub use extents::{DimensionExtent, Extents};
pub use file_backing::FileBackend;
pub use grid_box::GridData;
pub use implicit::{Coverage, ImplicitFunction};
pub use md_box::{BoxData, DiskRecord};
pub use node::{Aggregates, BoxWriter, MdNode, NodeSlot, NodeSummary};
pub use tree::{BoxTree, IntegrationResult};

#[cfg(test)]
mod tests {
    mod concurrency_tests;
    mod file_backing_tests;
    mod query_tests;
    mod split_tests;
    mod tree_tests;
}
