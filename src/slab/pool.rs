//! Slab pool implementation
//!
//! Owns all backing memory for value buffers in a small set of fixed size
//! classes. Total block counts are fixed at initialization, so running out
//! of memory is a well-defined `PoolExhausted` error rather than a platform
//! fault.

use super::block::BlockId;
use super::size_class::SizeClass;
use crate::config::SizeClassConfig;
use crate::error::{Error, Result};
use tracing::debug;

/// Bounded slab pool over a fixed set of size classes.
pub struct SlabPool {
    /// Size classes, sorted ascending by block size
    classes: Vec<SizeClass>,
}

impl SlabPool {
    /// Create a pool from the configured size classes.
    ///
    /// The class list must be sorted ascending and unique; `EngineConfig`
    /// validation enforces this before the pool is built.
    pub fn new(configs: &[SizeClassConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::InvalidBlock(
                "Cannot build a pool with no size classes".to_string(),
            ));
        }
        for window in configs.windows(2) {
            if window[1].block_size <= window[0].block_size {
                return Err(Error::InvalidBlock(format!(
                    "Size classes out of order: {} then {}",
                    window[0].block_size, window[1].block_size
                )));
            }
        }

        let classes = configs
            .iter()
            .enumerate()
            .map(|(index, c)| SizeClass::new(index as u16, c.block_size, c.block_count))
            .collect();

        Ok(Self { classes })
    }

    /// Allocate the smallest size class that can hold `capacity` bytes.
    ///
    /// Fails with `PoolExhausted` when that class has no free blocks; the
    /// pool never spills an allocation into a larger class and never grows.
    pub fn alloc(&mut self, capacity: usize) -> Result<BlockId> {
        let class_idx = self
            .classes
            .iter()
            .position(|sc| sc.can_fit(capacity))
            .ok_or_else(|| {
                Error::InvalidBlock(format!(
                    "Requested capacity {} exceeds largest size class {}",
                    capacity,
                    self.classes.last().map(|sc| sc.block_size).unwrap_or(0)
                ))
            })?;

        let class = &mut self.classes[class_idx];
        let slot = class.allocate().ok_or_else(|| {
            Error::PoolExhausted(format!(
                "No free blocks in size class {} ({} blocks in use)",
                class.block_size, class.block_count
            ))
        })?;

        let id = BlockId::new(class_idx as u16, slot);
        debug!(capacity, %id, "Allocated block");
        Ok(id)
    }

    /// Return a block to its class's free list.
    pub fn release(&mut self, id: BlockId) -> Result<()> {
        let class = self.class_mut(id)?;
        class.release(id.slot)?;
        debug!(%id, "Released block");
        Ok(())
    }

    /// Reallocate a block for a new capacity: allocate-new, copy, release-old.
    /// Blocks are never resized in place.
    pub fn realloc(&mut self, id: BlockId, new_capacity: usize) -> Result<BlockId> {
        // Validate the source before taking a new block
        let old_len = self.len(id)?;
        let new_id = self.alloc(new_capacity)?;

        let copy_len = old_len.min(new_capacity);
        let bytes = self.read(id)?[..copy_len].to_vec();
        // New block came fresh off the free heap, the write cannot fail
        if let Err(e) = self.write(new_id, &bytes) {
            self.release(new_id)?;
            return Err(e);
        }

        self.release(id)?;
        Ok(new_id)
    }

    /// Write bytes into a block.
    pub fn write(&mut self, id: BlockId, bytes: &[u8]) -> Result<()> {
        self.class_mut(id)?.write(id.slot, bytes)
    }

    /// Read the logical contents of a block.
    pub fn read(&self, id: BlockId) -> Result<&[u8]> {
        self.class_ref(id)?.read(id.slot)
    }

    /// Logical length of a block.
    pub fn len(&self, id: BlockId) -> Result<usize> {
        self.class_ref(id)?.len(id.slot)
    }

    /// Read a block as UTF-8 text.
    pub fn read_str(&self, id: BlockId) -> Result<&str> {
        std::str::from_utf8(self.read(id)?)
            .map_err(|e| Error::InvalidBlock(format!("Block {} is not UTF-8: {}", id, e)))
    }

    /// Allocate a block sized for `bytes` and write them.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<BlockId> {
        let id = self.alloc(bytes.len())?;
        if let Err(e) = self.write(id, bytes) {
            self.release(id)?;
            return Err(e);
        }
        Ok(id)
    }

    /// Per-class allocation statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for sc in &self.classes {
            stats.classes.push(ClassStats {
                block_size: sc.block_size,
                block_count: sc.block_count,
                used: sc.used_count(),
                free: sc.free_count(),
            });
            stats.bytes_in_use += sc.used_count() * sc.block_size;
        }
        stats
    }

    /// Total number of live blocks across all classes.
    pub fn blocks_in_use(&self) -> usize {
        self.classes.iter().map(|sc| sc.used_count()).sum()
    }

    fn class_ref(&self, id: BlockId) -> Result<&SizeClass> {
        self.classes.get(id.class_index()).ok_or_else(|| {
            Error::InvalidBlock(format!("Unknown size class index {}", id.class))
        })
    }

    fn class_mut(&mut self, id: BlockId) -> Result<&mut SizeClass> {
        self.classes.get_mut(id.class_index()).ok_or_else(|| {
            Error::InvalidBlock(format!("Unknown size class index {}", id.class))
        })
    }
}

/// Pool-wide statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub classes: Vec<ClassStats>,
    pub bytes_in_use: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub block_size: usize,
    pub block_count: usize,
    pub used: usize,
    pub free: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> SlabPool {
        SlabPool::new(&[
            SizeClassConfig {
                block_size: 16,
                block_count: 4,
            },
            SizeClassConfig {
                block_size: 256,
                block_count: 2,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_pool_smallest_fitting_class() -> Result<()> {
        let mut pool = small_pool();

        let a = pool.alloc(10)?;
        assert_eq!(a.class, 0);

        let b = pool.alloc(17)?;
        assert_eq!(b.class, 1);

        pool.write(a, b"0123456789")?;
        assert_eq!(pool.read(a)?, b"0123456789");
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() -> Result<()> {
        let mut pool = small_pool();

        // Fill the 256-byte class to its configured count
        let a = pool.alloc(100)?;
        let _b = pool.alloc(100)?;

        // The class is full even though the 16-byte class has room
        let err = pool.alloc(100).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));

        // Releasing one block makes the next allocation succeed
        pool.release(a)?;
        let c = pool.alloc(100)?;
        assert_eq!(c.class, 1);
        Ok(())
    }

    #[test]
    fn test_pool_oversized_request() {
        let mut pool = small_pool();
        let err = pool.alloc(1000).unwrap_err();
        assert!(matches!(err, Error::InvalidBlock(_)));
    }

    #[test]
    fn test_pool_realloc_moves_to_larger_class() -> Result<()> {
        let mut pool = small_pool();

        let a = pool.alloc_bytes(b"short")?;
        assert_eq!(a.class, 0);

        let b = pool.realloc(a, 64)?;
        assert_eq!(b.class, 1);
        assert_eq!(pool.read(b)?, b"short");

        // The old block was released back to its class
        assert_eq!(pool.stats().classes[0].used, 0);
        // And is no longer readable
        assert!(pool.read(a).is_err());
        Ok(())
    }

    #[test]
    fn test_pool_release_unknown_class() {
        let mut pool = small_pool();
        let err = pool.release(BlockId::new(9, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidBlock(_)));
    }

    #[test]
    fn test_pool_stats() -> Result<()> {
        let mut pool = small_pool();
        pool.alloc_bytes(b"abc")?;
        pool.alloc(100)?;

        let stats = pool.stats();
        assert_eq!(stats.classes.len(), 2);
        assert_eq!(stats.classes[0].used, 1);
        assert_eq!(stats.classes[1].used, 1);
        assert_eq!(stats.bytes_in_use, 16 + 256);
        assert_eq!(pool.blocks_in_use(), 2);
        Ok(())
    }
}
