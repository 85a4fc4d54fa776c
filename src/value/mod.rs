//! Hierarchical value trees
//!
//! Structured entry values are trees of arena-allocated nodes whose payloads
//! and labels live in the slab pool. The `text` module converts trees to and
//! from the linear structured-text form used by the store API and by
//! snapshots.

pub mod node;
pub mod text;

pub use node::{NodeArena, NodeId};
pub use text::{from_text, to_text};
