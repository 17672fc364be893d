#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! # mdbox: a multi-dimensional event box tree
//!
//! `mdbox` indexes weighted point events (coordinates plus signal, squared
//! error and provenance) in an adaptive N-dimensional tree. It features:
//! - Leaf boxes that split into regular grids once they pass a threshold
//! - Concurrent insertion with per-leaf locking and a worker pool for bulk loads
//! - Cached signal, error and centroid aggregates, with masking
//! - Sphere and box integration, and box enumeration filtered by region
//! - Optional file backing that evicts leaf buffers to a flat event file
//!
//! The usual entry point is [`MdEventWorkspace`]; [`BoxTree`] gives lower-level control.

pub mod api;
pub mod core;

// Re-export key types for easier use by library consumers
pub use crate::api::{EventBatch, IngestReport, MdEventWorkspace, WorkspaceStats};
pub use crate::core::common::{MdBoxError, NodeId};
pub use crate::core::config::WorkspaceConfig;
pub use crate::core::indexing::mdbox::{BoxController, BoxTree, Extents, ImplicitFunction, MdEvent};

/// Core result type for the library
pub type Result<T> = std::result::Result<T, MdBoxError>;
