use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in a box tree's arena.
///
/// Ids are assigned when a node is allocated, so the children of one split get
/// consecutive ids. The ordering is only meaningful as a hint for sequential disk
/// access; it is never used as a primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// The root of every tree.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}
