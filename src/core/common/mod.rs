pub mod error;
pub use error::MdBoxError;
pub mod lock_utils;
pub mod types;

pub use types::NodeId;
