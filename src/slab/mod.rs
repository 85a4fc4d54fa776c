//! Bounded slab pool
//!
//! All variable-length value buffers and tree-node payloads are backed by
//! this pool. It owns a small set of fixed size classes whose block counts
//! are decided once at startup; allocation failure is `PoolExhausted`, not
//! heap growth.

pub mod block;
pub mod pool;
pub mod size_class;

pub use block::BlockId;
pub use pool::{ClassStats, PoolStats, SlabPool};
pub use size_class::SizeClass;
