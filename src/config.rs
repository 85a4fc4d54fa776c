//! Engine configuration
//!
//! The capacity configuration is supplied once at startup by the surrounding
//! application: working-tier entry budget, importance score bounds, and the
//! size classes and counts for the slab pool. Every bound here is fixed for
//! the lifetime of the engine; nothing grows at runtime.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One slab size class: block capacity and the fixed number of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassConfig {
    /// Block capacity in bytes
    pub block_size: usize,
    /// Number of blocks, fixed at initialization
    pub block_count: usize,
}

/// Importance score bounds. Scores from external directives are clamped
/// into `[min, max]`; new entries start at `default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportanceBounds {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

impl Default for ImportanceBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: 100,
            default: 50,
        }
    }
}

impl ImportanceBounds {
    /// Clamp a score into the valid range.
    pub fn clamp(&self, score: u32) -> u32 {
        score.clamp(self.min, self.max)
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshot file path; the backup generation and lock file live at
    /// sibling paths.
    pub snapshot_path: PathBuf,
    /// Maximum number of working-layer entries
    pub working_budget: usize,
    /// Importance score bounds
    pub importance: ImportanceBounds,
    /// Maximum number of live directory entries across all layers
    pub max_entries: usize,
    /// Fixed capacity of the value-node arena
    pub node_capacity: usize,
    /// Slab size classes, sorted ascending by block size
    pub size_classes: Vec<SizeClassConfig>,
    /// Deadline for a single save/load in milliseconds; `None` disables it
    pub io_deadline_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("memtier.snapshot"),
            working_budget: 32,
            importance: ImportanceBounds::default(),
            max_entries: 4096,
            node_capacity: 8192,
            size_classes: default_size_classes(),
            io_deadline_ms: None,
        }
    }
}

/// Default size classes: 16 B to 1 MiB in the classic five steps.
pub fn default_size_classes() -> Vec<SizeClassConfig> {
    vec![
        SizeClassConfig {
            block_size: 16,
            block_count: 4096,
        },
        SizeClassConfig {
            block_size: 256,
            block_count: 1024,
        },
        SizeClassConfig {
            block_size: 4096,
            block_count: 256,
        },
        SizeClassConfig {
            block_size: 65536,
            block_count: 16,
        },
        SizeClassConfig {
            block_size: 1048576,
            block_count: 2,
        },
    ]
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Storage(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::MalformedInput(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.working_budget == 0 {
            return Err(Error::MalformedInput(
                "working_budget must be at least 1".to_string(),
            ));
        }
        if self.max_entries == 0 || self.node_capacity == 0 {
            return Err(Error::MalformedInput(
                "max_entries and node_capacity must be at least 1".to_string(),
            ));
        }
        if self.importance.min > self.importance.max {
            return Err(Error::MalformedInput(format!(
                "Inverted importance bounds: min {} > max {}",
                self.importance.min, self.importance.max
            )));
        }
        if self.importance.default < self.importance.min
            || self.importance.default > self.importance.max
        {
            return Err(Error::MalformedInput(format!(
                "Default importance {} outside [{}, {}]",
                self.importance.default, self.importance.min, self.importance.max
            )));
        }
        if self.size_classes.is_empty() {
            return Err(Error::MalformedInput(
                "At least one size class is required".to_string(),
            ));
        }
        for window in self.size_classes.windows(2) {
            if window[1].block_size <= window[0].block_size {
                return Err(Error::MalformedInput(format!(
                    "Size classes must be sorted ascending and unique: {} then {}",
                    window[0].block_size, window[1].block_size
                )));
            }
        }
        for class in &self.size_classes {
            if class.block_size == 0 || class.block_count == 0 {
                return Err(Error::MalformedInput(
                    "Size class with zero block_size or block_count".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.size_classes.len(), 5);
        assert_eq!(config.size_classes[0].block_size, 16);
        assert_eq!(config.size_classes[4].block_size, 1048576);
    }

    #[test]
    fn test_rejects_zero_budget() {
        let config = EngineConfig {
            working_budget: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unsorted_classes() {
        let mut config = EngineConfig::default();
        config.size_classes.swap(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_importance() {
        let config = EngineConfig {
            importance: ImportanceBounds {
                min: 60,
                max: 40,
                default: 50,
            },
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_importance_clamp() {
        let bounds = ImportanceBounds::default();
        assert_eq!(bounds.clamp(150), 100);
        assert_eq!(bounds.clamp(50), 50);
    }

    #[test]
    fn test_toml_roundtrip() -> Result<()> {
        let path = std::env::temp_dir().join(format!("memtier_cfg_{}.toml", std::process::id()));
        let config = EngineConfig {
            working_budget: 8,
            ..EngineConfig::default()
        };
        let text = toml::to_string(&config)
            .map_err(|e| Error::Storage(format!("serialize: {}", e)))?;
        std::fs::write(&path, text).map_err(|e| Error::Storage(format!("write: {}", e)))?;

        let loaded = EngineConfig::from_toml_file(&path)?;
        assert_eq!(loaded.working_budget, 8);
        assert_eq!(loaded.size_classes, config.size_classes);

        std::fs::remove_file(path).ok();
        Ok(())
    }
}
