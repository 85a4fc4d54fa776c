//! Layer transitions and working-set budget enforcement
//!
//! Values move between layers as a whole: demotion serializes the resident
//! tree to text and hands it to the tier store, promotion parses it back
//! into the arena. Each transition either completes or leaves the entry in
//! its previous state. Directives are the externally-driven form of the
//! same transitions and arrive from an untrusted producer, so they are
//! validated before dispatch.

use crate::directory::{KeyId, Layer, TagDirectory, ValueRef};
use crate::error::{Error, Result};
use crate::persist::TierStore;
use crate::slab::SlabPool;
use crate::value::{from_text, to_text, NodeArena};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One externally-requested memory operation.
///
/// The wire form addresses entries by key id only. A producer that knows an
/// entry by its tags resolves them first through `TagStore::find_key` and
/// puts the returned id in the directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    MoveToDisk { key: KeyId },
    MoveToWorking { key: KeyId },
    Archive { key: KeyId },
    SetImportance { key: KeyId, importance: u32 },
    Delete { key: KeyId },
}

impl Directive {
    /// Parse a batch of directives from their JSON wire form. Anything the
    /// producer got wrong is reported as malformed input, never panicked on.
    pub fn parse_batch(text: &str) -> Result<Vec<Directive>> {
        serde_json::from_str(text)
            .map_err(|e| Error::MalformedInput(format!("Bad directive batch: {}", e)))
    }

    fn key(&self) -> KeyId {
        match *self {
            Directive::MoveToDisk { key }
            | Directive::MoveToWorking { key }
            | Directive::Archive { key }
            | Directive::SetImportance { key, .. }
            | Directive::Delete { key } => key,
        }
    }
}

/// Borrowed view over the engine state a layer transition touches.
pub struct PagingContext<'a> {
    pub pool: &'a mut SlabPool,
    pub arena: &'a mut NodeArena,
    pub directory: &'a mut TagDirectory,
    pub tiers: &'a mut TierStore,
    pub working_budget: usize,
}

impl<'a> PagingContext<'a> {
    /// Apply one directive. Unknown keys are an error, not a silent skip, so
    /// a stale producer notices its view has drifted.
    pub fn apply(&mut self, directive: Directive) -> Result<()> {
        let key = directive.key();
        if self.directory.get(key).is_none() {
            return Err(Error::NotFound(format!("{}", key)));
        }
        match directive {
            Directive::MoveToDisk { key } => self.demote(key),
            Directive::MoveToWorking { key } => {
                self.promote(key)?;
                self.enforce_budget()?;
                Ok(())
            }
            Directive::Archive { key } => self.archive(key),
            Directive::SetImportance { key, importance } => {
                self.directory.set_importance(key, importance)
            }
            Directive::Delete { key } => self.delete(key).map(|_| ()),
        }
    }

    /// Move an entry to the disk layer. Demoting a disk entry is a no-op;
    /// an archived entry only changes layer, its text already lives in the
    /// tier store.
    pub fn demote(&mut self, key: KeyId) -> Result<()> {
        let entry = self
            .directory
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        match entry.layer {
            Layer::Disk => Ok(()),
            Layer::Archived => {
                self.set_layer(key, Layer::Archived, Layer::Disk)
            }
            Layer::Working => self.spill(key, Layer::Disk),
        }
    }

    /// Move an entry to the archived layer.
    pub fn archive(&mut self, key: KeyId) -> Result<()> {
        let entry = self
            .directory
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        match entry.layer {
            Layer::Archived => Ok(()),
            Layer::Disk => self.set_layer(key, Layer::Disk, Layer::Archived),
            Layer::Working => self.spill(key, Layer::Archived),
        }
    }

    /// Bring an entry into the working layer. The text is parsed into the
    /// arena before anything else changes, so a full pool or arena leaves
    /// the entry spilled where it was.
    pub fn promote(&mut self, key: KeyId) -> Result<()> {
        let entry = self
            .directory
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        if entry.layer == Layer::Working {
            return Ok(());
        }

        let text = self
            .tiers
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("{} has no tier text", key)))?;
        let node = from_text(self.arena, self.pool, &text)?;

        self.tiers.remove(key);
        let entry = self
            .directory
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        let from = entry.layer;
        entry.layer = Layer::Working;
        entry.value = ValueRef::Resident(node);
        debug!(key = %key, from = %from, "Promoted entry to working");
        Ok(())
    }

    /// Remove an entry entirely, releasing its value wherever it lives.
    pub fn delete(&mut self, key: KeyId) -> Result<bool> {
        let entry = match self.directory.remove(key) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        match entry.value {
            ValueRef::Resident(node) => self.arena.destroy(self.pool, node)?,
            ValueRef::Spilled => {
                self.tiers.remove(key);
            }
        }
        debug!(key = %key, "Deleted entry");
        Ok(true)
    }

    /// Demote lowest-importance working entries until the working layer is
    /// back inside the budget. Ties go to the entry with the oldest
    /// last-accessed timestamp, then the lowest key id.
    pub fn enforce_budget(&mut self) -> Result<Vec<KeyId>> {
        let mut demoted = Vec::new();
        while self.directory.count_by_layer(Layer::Working) > self.working_budget {
            let victim = self
                .directory
                .iter()
                .filter(|e| e.layer == Layer::Working)
                .min_by_key(|e| (e.importance, e.last_accessed, e.id))
                .map(|e| e.id);
            match victim {
                Some(key) => {
                    self.spill(key, Layer::Disk)?;
                    debug!(key = %key, "Demoted over-budget entry");
                    demoted.push(key);
                }
                None => break,
            }
        }
        Ok(demoted)
    }

    /// Serialize a working entry's tree and move the entry to `target`.
    fn spill(&mut self, key: KeyId, target: Layer) -> Result<()> {
        let entry = self
            .directory
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        let node = match entry.value {
            ValueRef::Resident(node) => node,
            ValueRef::Spilled => {
                return Err(Error::Storage(format!(
                    "{} is in the working layer without a resident value",
                    key
                )))
            }
        };

        let text = to_text(self.arena, self.pool, node)?;
        self.tiers.insert(key, text);
        if let Err(e) = self.arena.destroy(self.pool, node) {
            // Leave the entry resident rather than lose the tree
            warn!(key = %key, error = %e, "Failed to tear down demoted tree");
            self.tiers.remove(key);
            return Err(e);
        }

        let entry = self
            .directory
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        entry.layer = target;
        entry.value = ValueRef::Spilled;
        Ok(())
    }

    fn set_layer(&mut self, key: KeyId, expected: Layer, target: Layer) -> Result<()> {
        let entry = self
            .directory
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{}", key)))?;
        debug_assert_eq!(entry.layer, expected);
        entry.layer = target;
        Ok(())
    }
}
