pub mod ids;

pub use ids::NodeId;
