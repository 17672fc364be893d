pub mod common;
pub mod config;
pub mod indexing;
pub mod scheduler;
pub mod storage;
pub use self::config::WorkspaceConfig;
