pub mod mdbox;

pub use mdbox::{BoxController, BoxTree, MdEvent};
