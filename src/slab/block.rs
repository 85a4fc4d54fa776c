//! Block references for the slab pool

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to one allocated block in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Size class index (0 = smallest)
    pub class: u16,
    /// Block slot within the size class
    pub slot: u32,
}

impl BlockId {
    pub fn new(class: u16, slot: u32) -> Self {
        Self { class, slot }
    }

    /// Index into the pool's class table
    pub fn class_index(&self) -> usize {
        self.class as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(class={}, slot={})", self.class, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_creation() {
        let id = BlockId::new(3, 17);
        assert_eq!(id.class, 3);
        assert_eq!(id.slot, 17);
        assert_eq!(id.class_index(), 3);
    }

    #[test]
    fn test_block_id_display() {
        let id = BlockId::new(0, 5);
        assert_eq!(format!("{}", id), "Block(class=0, slot=5)");
    }
}
