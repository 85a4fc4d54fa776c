// memtier - Embedded tiered memory engine
// Tagged entries, bounded slab storage, three-layer paging

#![warn(rust_2018_idioms)]

pub mod config;
pub mod directory;
pub mod paging;
pub mod persist;
pub mod query;
pub mod slab;
pub mod store;
pub mod value;

// Re-exports for convenience
pub use config::{EngineConfig, ImportanceBounds, SizeClassConfig};
pub use directory::{ContextKey, KeyId, Layer, TagDirectory};
pub use paging::Directive;
pub use persist::LoadReport;
pub use query::{QueryCriteria, QueryHit, TimeField, TimeRange};
pub use store::{StoreStats, TagStore};

/// memtier error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// A size class's free list is empty. Recoverable: the caller can
        /// release blocks or the operator can raise the configured counts;
        /// the pool never grows on its own.
        #[error("Pool exhausted: {0}")]
        PoolExhausted(String),

        /// A block reference does not match any live allocation. Programming
        /// or corruption defect, always surfaced.
        #[error("Invalid block: {0}")]
        InvalidBlock(String),

        /// Structured-text input that cannot be parsed into a value tree.
        #[error("Malformed input: {0}")]
        MalformedInput(String),

        /// Missing key on retrieve/delete/directive. Expected and non-fatal.
        #[error("Not found: {0}")]
        NotFound(String),

        /// Another process holds the snapshot lock.
        #[error("Store locked: {0}")]
        StoreLocked(String),

        /// A disk I/O deadline was exceeded. State is unchanged.
        #[error("Timeout: {0}")]
        Timeout(String),

        /// A snapshot failed structural or checksum validation.
        #[error("Corrupt snapshot: {0}")]
        CorruptSnapshot(String),

        /// I/O and other storage-level failures.
        #[error("Storage error: {0}")]
        Storage(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
