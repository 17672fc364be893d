pub mod event_file;
pub mod leaf_cache;

pub use event_file::{EventFile, FileExtent};
pub use leaf_cache::LeafCache;
