//! Crash-safety tests: snapshot round trips, backup fallback, and
//! empty-but-usable recovery when every generation is gone.

use memtier::error::{Error, Result};
use memtier::{Directive, EngineConfig, LoadReport, QueryCriteria, TagStore};
use std::path::PathBuf;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(tag: &str) -> EngineConfig {
    EngineConfig {
        snapshot_path: std::env::temp_dir()
            .join(format!("memtier_pr_{}_{}.snapshot", tag, std::process::id())),
        working_budget: 4,
        max_entries: 64,
        node_capacity: 1024,
        ..EngineConfig::default()
    }
}

fn sibling(path: &PathBuf, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn cleanup(path: &PathBuf) {
    for suffix in ["", ".bak", ".tmp", ".lock"] {
        std::fs::remove_file(sibling(path, suffix)).ok();
    }
}

/// Populate a store with entries across all three layers and save.
fn populate_and_save(config: &EngineConfig) -> Result<()> {
    let store = TagStore::open(config.clone())?;
    store.store_with_importance(&["goal", "current"], r#"{"plan": "ship it"}"#, 90)?;
    let cold = store.store_with_importance(&["history", "old"], r#""done long ago""#, 15)?;
    store.store(&["notes"], r#"["first", "second"]"#)?;
    store.apply_directive(Directive::MoveToDisk { key: cold })?;
    store.apply_directive(Directive::Archive { key: cold })?;
    store.save()?;
    Ok(())
}

fn assert_populated(store: &TagStore) -> Result<()> {
    assert_eq!(store.retrieve(&["current", "goal"])?, r#"{"plan": "ship it"}"#);
    assert_eq!(store.retrieve(&["old", "history"])?, r#""done long ago""#);
    assert_eq!(store.retrieve(&["notes"])?, r#"["first", "second"]"#);
    Ok(())
}

#[test]
fn test_round_trip_preserves_state() -> Result<()> {
    init_logging();
    let config = test_config("roundtrip");
    let path = config.snapshot_path.clone();
    cleanup(&path);

    populate_and_save(&config)?;

    let store = TagStore::open(config)?;
    assert_eq!(store.load_report(), LoadReport::Loaded);
    assert_populated(&store)?;

    // Layers and importance survived the round trip
    let all = store.query(&QueryCriteria::default())?;
    assert_eq!(all.len(), 3);
    let stats = store.stats();
    assert_eq!(stats.working, 2);
    assert_eq!(stats.archived, 1);
    let cold = all
        .iter()
        .find(|h| h.tags == vec!["history", "old"])
        .expect("archived entry missing");
    assert_eq!(cold.importance, 15);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_truncated_snapshot_uses_backup() -> Result<()> {
    init_logging();
    let config = test_config("truncated");
    let path = config.snapshot_path.clone();
    cleanup(&path);

    populate_and_save(&config)?;
    {
        // A second save rotates the first snapshot into the backup slot
        let store = TagStore::open(config.clone())?;
        store.save()?;
    }

    let bytes = std::fs::read(&path).expect("snapshot missing");
    std::fs::write(&path, &bytes[..bytes.len() / 3]).expect("truncate failed");

    let store = TagStore::open(config)?;
    assert_eq!(store.load_report(), LoadReport::LoadedFromBackup);
    assert_populated(&store)?;

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_both_generations_corrupt_recovers_empty() -> Result<()> {
    init_logging();
    let config = test_config("corrupt");
    let path = config.snapshot_path.clone();
    cleanup(&path);

    populate_and_save(&config)?;
    {
        let store = TagStore::open(config.clone())?;
        store.save()?;
    }

    std::fs::write(&path, b"not a snapshot").expect("write failed");
    std::fs::write(sibling(&path, ".bak"), b"also not a snapshot").expect("write failed");

    // The engine still starts, empty but fully usable
    let store = TagStore::open(config)?;
    assert_eq!(store.load_report(), LoadReport::RecoveredEmpty);
    assert_eq!(store.stats().total_entries, 0);
    store.store(&["recovered"], r#""fresh start""#)?;
    assert_eq!(store.retrieve(&["recovered"])?, r#""fresh start""#);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_second_instance_is_locked_out() -> Result<()> {
    init_logging();
    let config = test_config("locked");
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let first = TagStore::open(config.clone())?;
    let second = TagStore::open(config);
    assert!(matches!(second, Err(Error::StoreLocked(_))));

    drop(first);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_drop_saves_unsaved_changes() -> Result<()> {
    init_logging();
    let config = test_config("drop");
    let path = config.snapshot_path.clone();
    cleanup(&path);

    {
        let store = TagStore::open(config.clone())?;
        store.store(&["implicit"], r#""saved on drop""#)?;
        // No explicit save
    }

    let store = TagStore::open(config)?;
    assert_eq!(store.load_report(), LoadReport::Loaded);
    assert_eq!(store.retrieve(&["implicit"])?, r#""saved on drop""#);

    drop(store);
    cleanup(&path);
    Ok(())
}
