use crate::core::common::types::NodeId;
use std::fmt;

#[derive(Debug)]
pub enum MdBoxError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Configuration(String),
    InvalidInput { message: String },
    DimensionMismatch { expected: usize, actual: usize },
    NodeNotFound(NodeId),
    UnexpectedNodeType { id: NodeId, expected: &'static str },
    Lock(String),
    Storage(String),
    Task(String),
    Internal(String),
}

impl fmt::Display for MdBoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO Error: {}", e),
            Self::Json(e) => write!(f, "JSON Serialization/Deserialization Error: {}", e),
            Self::Configuration(s) => write!(f, "Configuration error: {}", s),
            Self::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {}, got {}", expected, actual)
            }
            Self::NodeNotFound(id) => write!(f, "Node not found: {}", id),
            Self::UnexpectedNodeType { id, expected } => {
                write!(f, "Unexpected node type for {}: expected {}", id, expected)
            }
            Self::Lock(s) => write!(f, "Lock Error: {}", s),
            Self::Storage(s) => write!(f, "Storage Error: {}", s),
            Self::Task(s) => write!(f, "Task Error: {}", s),
            Self::Internal(s) => write!(f, "Internal Error: {}", s),
        }
    }
}

impl std::error::Error for MdBoxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MdBoxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for MdBoxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl MdBoxError {
    /// Shorthand for an `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// True for errors caused by the storage layer rather than by the caller.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}
