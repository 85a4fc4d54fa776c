//! Engine facade
//!
//! `TagStore` wires the slab pool, node arena, directory, tier store, and
//! persister together behind a single mutex, so the surrounding application
//! gets a plain synchronous API and never observes a half-applied
//! transition. All capacities are fixed at open time.

use crate::config::EngineConfig;
use crate::directory::{canonicalize_tags, KeyId, Layer, TagDirectory, ValueRef};
use crate::error::{Error, Result};
use crate::paging::{Directive, PagingContext};
use crate::persist::{LoadReport, Persister, TierStore};
use crate::query::{matches, relevance, QueryCriteria, QueryHit};
use crate::slab::SlabPool;
use crate::value::{from_text, to_text, NodeArena};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_entries: usize,
    pub working: usize,
    pub disk: usize,
    pub archived: usize,
    pub store_count: u64,
    pub access_count: u64,
    pub blocks_in_use: usize,
    pub bytes_in_use: usize,
    pub nodes_in_use: usize,
}

struct Inner {
    config: EngineConfig,
    pool: SlabPool,
    arena: NodeArena,
    directory: TagDirectory,
    tiers: TierStore,
    persister: Persister,
    load_report: LoadReport,
    dirty: bool,
}

/// The tagged store. Thread-safe; clone-free; one instance per snapshot
/// path per process (the persister's file lock enforces the cross-process
/// half).
pub struct TagStore {
    inner: Mutex<Inner>,
}

impl TagStore {
    /// Open the engine: build the fixed-capacity pool and arena, take the
    /// snapshot lock, and load whatever snapshot generation validates.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut pool = SlabPool::new(&config.size_classes)?;
        let mut arena = NodeArena::new(config.node_capacity);
        let persister = Persister::open(&config.snapshot_path, config.io_deadline_ms)?;
        let loaded = persister.load(
            &mut pool,
            &mut arena,
            config.max_entries,
            config.importance,
        )?;

        let mut inner = Inner {
            config,
            pool,
            arena,
            directory: loaded.directory,
            tiers: loaded.tiers,
            persister,
            load_report: loaded.report,
            dirty: false,
        };
        // A lowered budget in the config takes effect on the loaded state
        let demoted = inner.paging().enforce_budget()?;
        if !demoted.is_empty() {
            inner.dirty = true;
        }

        info!(
            entries = inner.directory.len(),
            report = ?inner.load_report,
            "Opened tag store"
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// How the snapshot load at open time resolved.
    pub fn load_report(&self) -> LoadReport {
        self.inner.lock().load_report
    }

    /// Store a value under a tag set at the default importance. An entry
    /// with the identical canonical tag set is updated in place, keeping
    /// its layer and importance.
    pub fn store<S: AsRef<str>>(&self, tags: &[S], value: &str) -> Result<KeyId> {
        self.store_inner(tags, value, None)
    }

    /// Store with an explicit importance score (clamped to the configured
    /// bounds). On update the score replaces the existing one.
    pub fn store_with_importance<S: AsRef<str>>(
        &self,
        tags: &[S],
        value: &str,
        importance: u32,
    ) -> Result<KeyId> {
        self.store_inner(tags, value, Some(importance))
    }

    fn store_inner<S: AsRef<str>>(
        &self,
        tags: &[S],
        value: &str,
        importance: Option<u32>,
    ) -> Result<KeyId> {
        let tags = canonicalize_tags(tags)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        // Parse before touching any existing state, so a malformed value or
        // a full pool leaves the previous value intact.
        let node = from_text(&mut inner.arena, &mut inner.pool, value)?;

        let id = match inner.directory.find(&tags) {
            Some(id) => {
                let entry = inner
                    .directory
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
                match entry.layer {
                    Layer::Working => {
                        let old = entry.value;
                        entry.value = ValueRef::Resident(node);
                        entry.last_accessed = Utc::now();
                        if let ValueRef::Resident(old_node) = old {
                            inner.arena.destroy(&mut inner.pool, old_node)?;
                        }
                    }
                    Layer::Disk | Layer::Archived => {
                        entry.last_accessed = Utc::now();
                        let normalized = to_text(&inner.arena, &inner.pool, node)?;
                        inner.arena.destroy(&mut inner.pool, node)?;
                        inner.tiers.insert(id, normalized);
                    }
                }
                if let Some(score) = importance {
                    inner.directory.set_importance(id, score)?;
                }
                debug!(key = %id, "Updated entry in place");
                id
            }
            None => {
                let score = importance.unwrap_or(inner.config.importance.default);
                match inner.directory.insert(
                    tags,
                    Layer::Working,
                    score,
                    ValueRef::Resident(node),
                ) {
                    Ok(id) => {
                        debug!(key = %id, "Stored new entry");
                        id
                    }
                    Err(e) => {
                        inner.arena.destroy(&mut inner.pool, node)?;
                        return Err(e);
                    }
                }
            }
        };

        inner.paging().enforce_budget()?;
        inner.dirty = true;
        Ok(id)
    }

    /// Retrieve the value stored under a tag set, without changing its
    /// layer. Bumps the access count and last-accessed timestamp.
    pub fn retrieve<S: AsRef<str>>(&self, tags: &[S]) -> Result<String> {
        let tags = canonicalize_tags(tags)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let id = inner
            .directory
            .find(&tags)
            .ok_or_else(|| Error::NotFound(format!("No entry for tags {:?}", tags)))?;
        inner.directory.touch(id)?;
        inner.dirty = true;
        inner.value_text(id)
    }

    /// Retrieve by key id, as returned from `store` or a query hit. Same
    /// access-metadata semantics as the tag form.
    pub fn retrieve_by_id(&self, id: KeyId) -> Result<String> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.directory.touch(id)?;
        inner.dirty = true;
        inner.value_text(id)
    }

    /// Retrieve and promote to the working layer, then re-enforce the
    /// budget. A full pool fails the promotion but still returns the value
    /// from its current layer.
    pub fn retrieve_promote<S: AsRef<str>>(&self, tags: &[S]) -> Result<String> {
        let tags = canonicalize_tags(tags)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let id = inner
            .directory
            .find(&tags)
            .ok_or_else(|| Error::NotFound(format!("No entry for tags {:?}", tags)))?;
        inner.directory.touch(id)?;
        inner.dirty = true;

        let mut ctx = inner.paging();
        if let Err(e) = ctx.promote(id) {
            warn!(key = %id, error = %e, "Promotion failed, serving from current layer");
        } else {
            ctx.enforce_budget()?;
        }
        inner.value_text(id)
    }

    /// Rank matching entries by relevance. Queries read across every layer
    /// and do not count as accesses.
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        let mut criteria = criteria.clone();
        criteria.tags = criteria
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        criteria.tags.sort();
        criteria.tags.dedup();

        let inner = self.inner.lock();
        let now = Utc::now();

        let mut ranked: Vec<(u32, KeyId)> = inner
            .directory
            .iter()
            .filter(|e| matches(e, &criteria))
            .map(|e| (relevance(e, &criteria, now), e.id))
            .collect();
        // Highest score first; insertion order breaks ties
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        if let Some(cap) = criteria.max_results {
            ranked.truncate(cap);
        }

        let mut hits = Vec::with_capacity(ranked.len());
        for (score, id) in ranked {
            let entry = inner
                .directory
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
            hits.push(QueryHit {
                key_id: id,
                tags: entry.tags.clone(),
                value: inner.value_text(id)?,
                importance: entry.importance,
                layer: entry.layer,
                score,
            });
        }
        Ok(hits)
    }

    /// Resolve a tag set to its key id without touching access metadata.
    /// Directive producers address entries this way before building the
    /// key-addressed wire form.
    pub fn find_key<S: AsRef<str>>(&self, tags: &[S]) -> Result<KeyId> {
        let tags = canonicalize_tags(tags)?;
        let inner = self.inner.lock();
        inner
            .directory
            .find(&tags)
            .ok_or_else(|| Error::NotFound(format!("No entry for tags {:?}", tags)))
    }

    /// Delete the entry with the identical canonical tag set. A missing
    /// entry is `NotFound`, never a crash; the directory is unchanged in
    /// that case.
    pub fn delete<S: AsRef<str>>(&self, tags: &[S]) -> Result<()> {
        let tags = canonicalize_tags(tags)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let id = inner
            .directory
            .find(&tags)
            .ok_or_else(|| Error::NotFound(format!("No entry for tags {:?}", tags)))?;
        inner.paging().delete(id)?;
        inner.dirty = true;
        Ok(())
    }

    /// Delete by key id. Same `NotFound` semantics as the tag form.
    pub fn delete_by_id(&self, id: KeyId) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if !inner.paging().delete(id)? {
            return Err(Error::NotFound(format!("{}", id)));
        }
        inner.dirty = true;
        Ok(())
    }

    /// Apply one externally-produced directive.
    pub fn apply_directive(&self, directive: Directive) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.paging().apply(directive)?;
        inner.dirty = true;
        Ok(())
    }

    /// Apply a directive batch in order, stopping at the first failure.
    /// Directives applied before the failure stay applied; each one is
    /// atomic on its own. A completed non-empty batch is checkpointed to
    /// the snapshot; a failing checkpoint keeps the changes in memory and
    /// leaves them for the next save.
    pub fn apply_directives(&self, directives: &[Directive]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut applied = 0;
        for directive in directives {
            if let Err(e) = inner.paging().apply(*directive) {
                if applied > 0 {
                    inner.dirty = true;
                }
                warn!(applied, error = %e, "Directive batch stopped");
                return Err(e);
            }
            applied += 1;
        }
        if applied > 0 {
            inner.dirty = true;
            match inner
                .persister
                .save(&inner.directory, &inner.tiers, &inner.arena, &inner.pool)
            {
                Ok(()) => inner.dirty = false,
                Err(e) => warn!(error = %e, "Post-batch checkpoint failed"),
            }
        }
        Ok(applied)
    }

    /// Remove archived entries whose last access is older than `max_age`
    /// and whose importance is below `min_importance`. Both criteria must
    /// hold; high-importance entries survive regardless of age. Returns the
    /// number of entries removed.
    pub fn cleanup_expired(&self, max_age: Duration, min_importance: u32) -> Result<usize> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let cutoff = Utc::now() - max_age;
        let expired: Vec<KeyId> = inner
            .directory
            .iter()
            .filter(|e| {
                e.layer == Layer::Archived
                    && e.last_accessed < cutoff
                    && e.importance < min_importance
            })
            .map(|e| e.id)
            .collect();

        let mut removed = 0;
        for id in &expired {
            if inner.paging().delete(*id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            inner.dirty = true;
            info!(removed, "Expired archived entries");
        }
        Ok(removed)
    }

    /// Write a snapshot now.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner
            .persister
            .save(&inner.directory, &inner.tiers, &inner.arena, &inner.pool)?;
        inner.dirty = false;
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let dir = inner.directory.stats();
        let pool = inner.pool.stats();
        StoreStats {
            total_entries: dir.total,
            working: dir.working,
            disk: dir.disk,
            archived: dir.archived,
            store_count: dir.store_count,
            access_count: dir.access_count,
            blocks_in_use: inner.pool.blocks_in_use(),
            bytes_in_use: pool.bytes_in_use,
            nodes_in_use: inner.arena.nodes_in_use(),
        }
    }
}

impl Inner {
    fn paging(&mut self) -> PagingContext<'_> {
        PagingContext {
            pool: &mut self.pool,
            arena: &mut self.arena,
            directory: &mut self.directory,
            tiers: &mut self.tiers,
            working_budget: self.config.working_budget,
        }
    }

    fn value_text(&self, id: KeyId) -> Result<String> {
        let entry = self
            .directory
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("{}", id)))?;
        match entry.value {
            ValueRef::Resident(node) => to_text(&self.arena, &self.pool, node),
            ValueRef::Spilled => self
                .tiers
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Storage(format!("{} has no tier text", id))),
        }
    }
}

impl Drop for TagStore {
    /// Best-effort snapshot of unsaved changes. Failures are logged, never
    /// panicked on; the previous snapshot generation is still on disk.
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.dirty {
            return;
        }
        if let Err(e) =
            inner
                .persister
                .save(&inner.directory, &inner.tiers, &inner.arena, &inner.pool)
        {
            warn!(error = %e, "Final snapshot failed, unsaved changes lost");
        }
    }
}
