//! Public API module for mdbox
//!
//! The main entry point is [`MdEventWorkspace`], which ties a configuration,
//! a box tree and a worker pool together.

pub mod types;
pub mod workspace;

pub use types::{EventBatch, IngestReport, WorkspaceStats};
pub use workspace::MdEventWorkspace;
