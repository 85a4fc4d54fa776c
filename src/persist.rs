//! Snapshot persistence
//!
//! The directory and tier contents are serialized into a single snapshot
//! file: a header line carrying magic, payload length, and an FNV-1a
//! checksum, followed by a structured-text body with `meta`, `directory`,
//! and `values` sections. Writes go to a temp file first and replace the
//! previous snapshot by rename, keeping one backup generation; loads fall
//! back to the backup on validation failure and, as a last resort, start
//! empty rather than failing the host process.

use crate::directory::{ContextKey, KeyId, Layer, TagDirectory, ValueRef};
use crate::error::{Error, Result};
use crate::slab::SlabPool;
use crate::value::text::{from_text, to_text, write_quoted};
use crate::value::{NodeArena, NodeId};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAGIC: &str = "memtier1";

/// How a load resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReport {
    /// No snapshot existed; first run
    Fresh,
    /// Current snapshot loaded cleanly
    Loaded,
    /// Current snapshot was invalid; the backup generation loaded
    LoadedFromBackup,
    /// Both generations were invalid; starting from an empty directory
    RecoveredEmpty,
}

/// Text values of disk- and archived-layer entries.
#[derive(Debug, Default)]
pub struct TierStore {
    values: BTreeMap<u64, String>,
}

impl TierStore {
    pub fn insert(&mut self, id: KeyId, text: String) {
        self.values.insert(id.0, text);
    }

    pub fn get(&self, id: KeyId) -> Option<&String> {
        self.values.get(&id.0)
    }

    pub fn remove(&mut self, id: KeyId) -> Option<String> {
        self.values.remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// State handed back by [`Persister::load`].
pub struct LoadedState {
    pub directory: TagDirectory,
    pub tiers: TierStore,
    pub report: LoadReport,
}

/// Owns the snapshot paths and the cross-process file lock.
pub struct Persister {
    path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
    deadline: Option<Duration>,
    // Held exclusively for the engine's lifetime
    _lock: File,
}

impl Persister {
    /// Open the snapshot location and take the exclusive file lock. A second
    /// process (or engine instance) fails fast with `StoreLocked`.
    pub fn open(path: &Path, io_deadline_ms: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create snapshot directory: {}", e))
                })?;
            }
        }

        let lock_path = sibling(path, ".lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| Error::Storage(format!("Failed to open lock file: {}", e)))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::StoreLocked(format!(
                "Another instance holds {}",
                lock_path.display()
            ))
        })?;

        info!(path = ?path, "Opened snapshot location");
        Ok(Self {
            path: path.to_path_buf(),
            backup_path: sibling(path, ".bak"),
            temp_path: sibling(path, ".tmp"),
            deadline: io_deadline_ms.map(Duration::from_millis),
            _lock: lock,
        })
    }

    /// Serialize the full state and atomically replace the snapshot,
    /// rotating the previous one to the backup generation.
    pub fn save(
        &self,
        directory: &TagDirectory,
        tiers: &TierStore,
        arena: &NodeArena,
        pool: &SlabPool,
    ) -> Result<()> {
        let deadline = Deadline::start(self.deadline);

        let body = build_body(directory, tiers, arena, pool)?;
        let mut bytes = format!(
            "{} len={} checksum={:016x}\n",
            MAGIC,
            body.len(),
            fnv1a(body.as_bytes())
        )
        .into_bytes();
        bytes.extend_from_slice(body.as_bytes());

        deadline.check("snapshot serialization")?;

        let mut file = File::create(&self.temp_path)
            .map_err(|e| Error::Storage(format!("Failed to create temp snapshot: {}", e)))?;
        file.write_all(&bytes)
            .map_err(|e| Error::Storage(format!("Failed to write snapshot: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync snapshot: {}", e)))?;
        drop(file);

        // Post-write confirmation before the old snapshot is touched
        let written = std::fs::read(&self.temp_path)
            .map_err(|e| Error::Storage(format!("Failed to re-read snapshot: {}", e)))?;
        verify(&written)?;

        deadline.check("snapshot write")?;

        // Rotate: current becomes the one-generation backup, temp becomes
        // current. A crash between the renames leaves a valid generation in
        // place either way.
        if self.path.exists() {
            std::fs::rename(&self.path, &self.backup_path)
                .map_err(|e| Error::Storage(format!("Failed to rotate backup: {}", e)))?;
        }
        std::fs::rename(&self.temp_path, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to publish snapshot: {}", e)))?;

        debug!(
            entries = directory.len(),
            bytes = bytes.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    /// Load the current snapshot, falling back to the backup generation and
    /// finally to an empty directory. Never fails the host over corruption.
    pub fn load(
        &self,
        pool: &mut SlabPool,
        arena: &mut NodeArena,
        max_entries: usize,
        importance: crate::config::ImportanceBounds,
    ) -> Result<LoadedState> {
        let deadline = Deadline::start(self.deadline);
        let fresh = |report| LoadedState {
            directory: TagDirectory::new(max_entries, importance),
            tiers: TierStore::default(),
            report,
        };

        let current = read_optional(&self.path)?;
        deadline.check("snapshot read")?;

        let mut current_failed = false;
        if let Some(bytes) = current {
            match parse_snapshot(&bytes, pool, arena, max_entries, importance) {
                Ok((directory, tiers)) => {
                    info!(entries = directory.len(), "Loaded snapshot");
                    return Ok(LoadedState {
                        directory,
                        tiers,
                        report: LoadReport::Loaded,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Snapshot invalid, trying backup generation");
                    current_failed = true;
                }
            }
        }

        let backup = read_optional(&self.backup_path)?;
        deadline.check("backup read")?;

        if let Some(bytes) = backup {
            match parse_snapshot(&bytes, pool, arena, max_entries, importance) {
                Ok((directory, tiers)) => {
                    warn!(entries = directory.len(), "Recovered from backup snapshot");
                    return Ok(LoadedState {
                        directory,
                        tiers,
                        report: LoadReport::LoadedFromBackup,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Backup snapshot invalid");
                    current_failed = true;
                }
            }
        }

        if current_failed {
            warn!("Both snapshot generations invalid, starting empty");
            Ok(fresh(LoadReport::RecoveredEmpty))
        } else {
            info!("No snapshot found, starting fresh");
            Ok(fresh(LoadReport::Fresh))
        }
    }
}

/// Structural and checksum validation. Returns the body on success.
pub fn verify(bytes: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::CorruptSnapshot(format!("Snapshot is not UTF-8: {}", e)))?;
    let (header, body) = text
        .split_once('\n')
        .ok_or_else(|| Error::CorruptSnapshot("Missing snapshot header".to_string()))?;

    let mut fields = header.split(' ');
    if fields.next() != Some(MAGIC) {
        return Err(Error::CorruptSnapshot("Bad magic".to_string()));
    }
    let len: usize = fields
        .next()
        .and_then(|f| f.strip_prefix("len="))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::CorruptSnapshot("Bad length field".to_string()))?;
    let checksum: u64 = fields
        .next()
        .and_then(|f| f.strip_prefix("checksum="))
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .ok_or_else(|| Error::CorruptSnapshot("Bad checksum field".to_string()))?;

    if body.len() != len {
        return Err(Error::CorruptSnapshot(format!(
            "Body length {} does not match header {}",
            body.len(),
            len
        )));
    }
    if fnv1a(body.as_bytes()) != checksum {
        return Err(Error::CorruptSnapshot("Checksum mismatch".to_string()));
    }
    Ok(body)
}

fn build_body(
    directory: &TagDirectory,
    tiers: &TierStore,
    arena: &NodeArena,
    pool: &SlabPool,
) -> Result<String> {
    let mut out = String::new();
    out.push_str("{\"meta\": {\"version\": \"1\", \"next_key_id\": ");
    write_quoted(&mut out, &directory.next_id().to_string());
    out.push_str(", \"saved_at\": ");
    write_quoted(&mut out, &Utc::now().to_rfc3339());
    out.push_str("}, \"directory\": [");

    for (i, entry) in directory.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_entry(&mut out, entry);
    }

    out.push_str("], \"values\": {");
    for (i, entry) in directory.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let text = match entry.value {
            ValueRef::Resident(node) => to_text(arena, pool, node)?,
            ValueRef::Spilled => tiers
                .get(entry.id)
                .cloned()
                .ok_or_else(|| {
                    Error::Storage(format!("{} has no tier text", entry.id))
                })?,
        };
        write_quoted(&mut out, &entry.id.0.to_string());
        out.push_str(": ");
        write_quoted(&mut out, &text);
    }
    out.push_str("}}");
    Ok(out)
}

fn write_entry(out: &mut String, entry: &ContextKey) {
    out.push_str("{\"id\": ");
    write_quoted(out, &entry.id.0.to_string());
    out.push_str(", \"tags\": [");
    for (i, tag) in entry.tags.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_quoted(out, tag);
    }
    out.push_str("], \"layer\": ");
    write_quoted(out, entry.layer.as_str());
    out.push_str(", \"importance\": ");
    write_quoted(out, &entry.importance.to_string());
    out.push_str(", \"created_at\": ");
    write_quoted(out, &entry.created_at.to_rfc3339());
    out.push_str(", \"last_accessed\": ");
    write_quoted(out, &entry.last_accessed.to_rfc3339());
    out.push_str(", \"access_count\": ");
    write_quoted(out, &entry.access_count.to_string());
    out.push('}');
}

fn parse_snapshot(
    bytes: &[u8],
    pool: &mut SlabPool,
    arena: &mut NodeArena,
    max_entries: usize,
    importance: crate::config::ImportanceBounds,
) -> Result<(TagDirectory, TierStore)> {
    let body = verify(bytes)?;
    let root = from_text(arena, pool, body)
        .map_err(|e| Error::CorruptSnapshot(format!("Unparseable body: {}", e)))?;

    let extracted = extract_state(pool, arena, root);
    // The snapshot tree is scaffolding either way; tear it down before
    // rebuilding values so the pool is free for the working tier.
    arena.destroy(pool, root)?;
    let (next_key_id, entries) = extracted?;

    let mut directory = TagDirectory::new(max_entries, importance);
    let mut tiers = TierStore::default();
    // Values already rebuilt in the arena; released as a group if a later
    // entry fails, so a rejected snapshot costs no pool capacity
    let mut resident: Vec<NodeId> = Vec::new();

    for (mut entry, text) in entries {
        match entry.layer {
            Layer::Working => {
                let node = match from_text(arena, pool, &text) {
                    Ok(node) => node,
                    Err(e) => {
                        release_resident(pool, arena, &resident);
                        return Err(Error::CorruptSnapshot(format!(
                            "Bad value for {}: {}",
                            entry.id, e
                        )));
                    }
                };
                resident.push(node);
                entry.value = ValueRef::Resident(node);
            }
            Layer::Disk | Layer::Archived => {
                entry.value = ValueRef::Spilled;
                tiers.insert(entry.id, text);
            }
        }
        if let Err(e) = directory.restore(entry) {
            release_resident(pool, arena, &resident);
            return Err(e);
        }
    }
    directory.set_next_id(next_key_id);

    Ok((directory, tiers))
}

fn release_resident(pool: &mut SlabPool, arena: &mut NodeArena, nodes: &[NodeId]) {
    for &node in nodes {
        if let Err(e) = arena.destroy(pool, node) {
            warn!(node = %node, error = %e, "Failed to release partially restored value");
        }
    }
}

type RawEntries = Vec<(ContextKey, String)>;

fn extract_state(
    pool: &SlabPool,
    arena: &NodeArena,
    root: NodeId,
) -> Result<(u64, RawEntries)> {
    let next_key_id: u64 = leaf_str(pool, arena, root, "meta.next_key_id")?
        .parse()
        .map_err(|e| Error::CorruptSnapshot(format!("Bad next_key_id: {}", e)))?;

    let dir_node = arena
        .resolve_path(pool, root, "directory")?
        .ok_or_else(|| Error::CorruptSnapshot("Missing directory section".to_string()))?;

    let mut entries = Vec::new();
    for entry_node in arena.children(dir_node)? {
        let id: u64 = field_str(pool, arena, entry_node, "id")?
            .parse()
            .map_err(|e| Error::CorruptSnapshot(format!("Bad entry id: {}", e)))?;

        let tags_node = arena
            .find_child_by_key(pool, entry_node, "tags")?
            .ok_or_else(|| Error::CorruptSnapshot(format!("key#{} missing tags", id)))?;
        let mut tags = Vec::new();
        for tag_node in arena.children(tags_node)? {
            let tag = arena
                .payload(pool, tag_node)?
                .ok_or_else(|| Error::CorruptSnapshot("Tag is not a scalar".to_string()))?;
            tags.push(
                String::from_utf8(tag.to_vec())
                    .map_err(|e| Error::CorruptSnapshot(format!("Bad tag: {}", e)))?,
            );
        }
        if tags.is_empty() {
            return Err(Error::CorruptSnapshot(format!("key#{} has no tags", id)));
        }

        let layer: Layer = field_str(pool, arena, entry_node, "layer")?
            .parse()
            .map_err(|e| Error::CorruptSnapshot(format!("{}", e)))?;
        let entry_importance: u32 = field_str(pool, arena, entry_node, "importance")?
            .parse()
            .map_err(|e| Error::CorruptSnapshot(format!("Bad importance: {}", e)))?;
        let created_at = parse_timestamp(&field_str(pool, arena, entry_node, "created_at")?)?;
        let last_accessed =
            parse_timestamp(&field_str(pool, arena, entry_node, "last_accessed")?)?;
        let access_count: u64 = field_str(pool, arena, entry_node, "access_count")?
            .parse()
            .map_err(|e| Error::CorruptSnapshot(format!("Bad access_count: {}", e)))?;

        let text = leaf_str(pool, arena, root, &format!("values.{}", id))?;

        entries.push((
            ContextKey {
                id: KeyId(id),
                tags,
                layer,
                importance: entry_importance,
                created_at,
                last_accessed,
                access_count,
                value: ValueRef::Spilled,
            },
            text,
        ));
    }

    Ok((next_key_id, entries))
}

fn leaf_str(pool: &SlabPool, arena: &NodeArena, root: NodeId, path: &str) -> Result<String> {
    let node = arena
        .resolve_path(pool, root, path)?
        .ok_or_else(|| Error::CorruptSnapshot(format!("Missing snapshot field {}", path)))?;
    let payload = arena
        .payload(pool, node)?
        .ok_or_else(|| Error::CorruptSnapshot(format!("{} is not a scalar", path)))?;
    String::from_utf8(payload.to_vec())
        .map_err(|e| Error::CorruptSnapshot(format!("Bad field {}: {}", path, e)))
}

fn field_str(pool: &SlabPool, arena: &NodeArena, node: NodeId, key: &str) -> Result<String> {
    let child = arena
        .find_child_by_key(pool, node, key)?
        .ok_or_else(|| Error::CorruptSnapshot(format!("Missing entry field {}", key)))?;
    let payload = arena
        .payload(pool, child)?
        .ok_or_else(|| Error::CorruptSnapshot(format!("Field {} is not a scalar", key)))?;
    String::from_utf8(payload.to_vec())
        .map_err(|e| Error::CorruptSnapshot(format!("Bad field {}: {}", key, e)))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CorruptSnapshot(format!("Bad timestamp '{}': {}", text, e)))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Storage(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deadline enforced between the discrete steps of a save/load. State is
/// only ever inspected at step boundaries, so a timeout leaves the previous
/// snapshot untouched.
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self, step: &str) -> Result<()> {
        if let Some(limit) = self.limit {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(Error::Timeout(format!(
                    "{} exceeded {:?} (elapsed {:?})",
                    step, limit, elapsed
                )));
            }
        }
        Ok(())
    }
}
