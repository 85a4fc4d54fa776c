//! Tag-keyed directory
//!
//! The authoritative index of every live entry: canonical tag set, layer,
//! importance, timestamps, access count, and a reference to the value. The
//! canonical tag set is the entry's unique key; two live entries never share
//! one.

use crate::config::ImportanceBounds;
use crate::error::{Error, Result};
use crate::value::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Storage layer of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Capacity-bounded, always-in-memory tier
    Working,
    /// Larger, slower tier; values are not memory-resident
    Disk,
    /// Cold tier for long-retention, low-access data; subject to expiry
    Archived,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Working => "working",
            Layer::Disk => "disk",
            Layer::Archived => "archived",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "working" => Ok(Layer::Working),
            "disk" => Ok(Layer::Disk),
            "archived" => Ok(Layer::Archived),
            other => Err(Error::MalformedInput(format!("Unknown layer '{}'", other))),
        }
    }
}

/// Directory key. Assigned monotonically and preserved across save/load, so
/// insertion order is stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Where an entry's value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    /// Working layer: a tree in the node arena
    Resident(NodeId),
    /// Disk or archived layer: text held by the tier store
    Spilled,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct ContextKey {
    pub id: KeyId,
    /// Canonical tag set: trimmed, sorted, deduplicated; case preserved
    pub tags: Vec<String>,
    pub layer: Layer,
    pub importance: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub value: ValueRef,
}

/// Canonicalize a tag set: trim surrounding whitespace, drop empties, sort
/// lexicographically, deduplicate. Case is preserved and matching stays
/// case-sensitive. An empty canonical set is rejected.
pub fn canonicalize_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<String>> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    if out.is_empty() {
        return Err(Error::MalformedInput(
            "Tag set is empty after canonicalization".to_string(),
        ));
    }
    Ok(out)
}

/// Aggregate directory statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryStats {
    pub total: usize,
    pub working: usize,
    pub disk: usize,
    pub archived: usize,
    pub store_count: u64,
    pub access_count: u64,
}

/// The directory proper: entries in insertion order, bounded by
/// `max_entries`.
pub struct TagDirectory {
    entries: BTreeMap<u64, ContextKey>,
    next_id: u64,
    max_entries: usize,
    importance: ImportanceBounds,
    store_count: u64,
    access_count: u64,
}

impl TagDirectory {
    pub fn new(max_entries: usize, importance: ImportanceBounds) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            max_entries,
            importance,
            store_count: 0,
            access_count: 0,
        }
    }

    pub fn importance_bounds(&self) -> ImportanceBounds {
        self.importance
    }

    /// Insert a new entry. The tag set must already be canonical and unique;
    /// `find` first when upsert semantics are wanted.
    pub fn insert(
        &mut self,
        tags: Vec<String>,
        layer: Layer,
        importance: u32,
        value: ValueRef,
    ) -> Result<KeyId> {
        if self.entries.len() >= self.max_entries {
            return Err(Error::PoolExhausted(format!(
                "Directory is full ({} entries)",
                self.max_entries
            )));
        }
        if self.find(&tags).is_some() {
            return Err(Error::InvalidBlock(format!(
                "Duplicate canonical tag set {:?}",
                tags
            )));
        }

        let id = KeyId(self.next_id);
        self.next_id += 1;
        let now = Utc::now();
        self.entries.insert(
            id.0,
            ContextKey {
                id,
                tags,
                layer,
                importance: self.importance.clamp(importance),
                created_at: now,
                last_accessed: now,
                access_count: 0,
                value,
            },
        );
        self.store_count += 1;
        Ok(id)
    }

    /// Re-insert a fully formed entry (snapshot load path). Keeps `next_id`
    /// ahead of every restored id.
    pub fn restore(&mut self, entry: ContextKey) -> Result<()> {
        if self.entries.len() >= self.max_entries {
            return Err(Error::PoolExhausted(format!(
                "Directory is full ({} entries)",
                self.max_entries
            )));
        }
        if self.entries.contains_key(&entry.id.0) {
            return Err(Error::CorruptSnapshot(format!(
                "Duplicate key id {} in snapshot",
                entry.id
            )));
        }
        self.next_id = self.next_id.max(entry.id.0 + 1);
        self.entries.insert(entry.id.0, entry);
        Ok(())
    }

    /// Find the entry with an identical canonical tag set.
    pub fn find(&self, tags: &[String]) -> Option<KeyId> {
        self.entries
            .values()
            .find(|e| e.tags == tags)
            .map(|e| e.id)
    }

    pub fn get(&self, id: KeyId) -> Option<&ContextKey> {
        self.entries.get(&id.0)
    }

    pub fn get_mut(&mut self, id: KeyId) -> Option<&mut ContextKey> {
        self.entries.get_mut(&id.0)
    }

    /// Entries of one layer in insertion order.
    pub fn list_by_layer(&self, layer: Layer) -> Vec<KeyId> {
        self.entries
            .values()
            .filter(|e| e.layer == layer)
            .map(|e| e.id)
            .collect()
    }

    pub fn count_by_layer(&self, layer: Layer) -> usize {
        self.entries.values().filter(|e| e.layer == layer).count()
    }

    /// Bump access count and last-accessed timestamp.
    pub fn touch(&mut self, id: KeyId) -> Result<()> {
        self.access_count += 1;
        let entry = self
            .entries
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
        entry.access_count += 1;
        entry.last_accessed = Utc::now();
        Ok(())
    }

    /// Set an entry's importance, clamped to the configured bounds.
    pub fn set_importance(&mut self, id: KeyId, score: u32) -> Result<()> {
        let clamped = self.importance.clamp(score);
        let entry = self
            .entries
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
        entry.importance = clamped;
        Ok(())
    }

    /// Remove an entry, returning it so the caller can release its value.
    pub fn remove(&mut self, id: KeyId) -> Option<ContextKey> {
        self.entries.remove(&id.0)
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ContextKey> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            total: self.entries.len(),
            working: self.count_by_layer(Layer::Working),
            disk: self.count_by_layer(Layer::Disk),
            archived: self.count_by_layer(Layer::Archived),
            store_count: self.store_count,
            access_count: self.access_count,
        }
    }
}
