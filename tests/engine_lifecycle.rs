//! End-to-end lifecycle tests: store, layering under budget pressure,
//! directives, and allocator capacity behavior.

use memtier::error::{Error, Result};
use memtier::slab::SlabPool;
use memtier::{
    Directive, EngineConfig, KeyId, Layer, QueryCriteria, SizeClassConfig, TagStore,
};
use std::path::PathBuf;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(tag: &str, working_budget: usize) -> EngineConfig {
    EngineConfig {
        snapshot_path: std::env::temp_dir()
            .join(format!("memtier_it_{}_{}.snapshot", tag, std::process::id())),
        working_budget,
        max_entries: 64,
        node_capacity: 1024,
        ..EngineConfig::default()
    }
}

fn cleanup(path: &PathBuf) {
    for suffix in ["", ".bak", ".tmp", ".lock"] {
        let mut os = path.as_os_str().to_os_string();
        os.push(suffix);
        std::fs::remove_file(PathBuf::from(os)).ok();
    }
}

#[test]
fn test_store_then_query_single_entry() -> Result<()> {
    init_logging();
    let config = test_config("single", 8);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    store.store(&["task", "goal"], r#""Plan X""#)?;

    let hits = store.query(&QueryCriteria::with_tags(["task"]))?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].tags, vec!["goal", "task"]);
    assert_eq!(hits[0].value, r#""Plan X""#);
    assert_eq!(hits[0].layer, Layer::Working);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_canonicalization_resolves_to_same_entry() -> Result<()> {
    init_logging();
    let config = test_config("canonical", 8);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    let first = store.store(&["b", "a", "a"], r#""v1""#)?;
    let second = store.store(&["a", "b"], r#""v2""#)?;
    assert_eq!(first, second);
    assert_eq!(store.stats().total_entries, 1);
    assert_eq!(store.retrieve(&[" b ", "a"])?, r#""v2""#);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_budget_pressure_demotes_lowest_importance() -> Result<()> {
    init_logging();
    let config = test_config("pressure", 2);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    let low = store.store_with_importance(&["one"], r#""1""#, 10)?;
    store.store_with_importance(&["two"], r#""2""#, 50)?;
    store.store_with_importance(&["three"], r#""3""#, 90)?;

    let stats = store.stats();
    assert_eq!(stats.working, 2);
    assert_eq!(stats.disk, 1);

    let disk = store.query(&QueryCriteria {
        layer: Some(Layer::Disk),
        ..QueryCriteria::default()
    })?;
    assert_eq!(disk.len(), 1);
    assert_eq!(disk[0].key_id, low);
    assert_eq!(disk[0].importance, 10);

    // The demoted value is still readable without promotion
    assert_eq!(store.retrieve(&["one"])?, r#""1""#);
    assert_eq!(store.stats().disk, 1);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_archive_directive_leaves_working_queries() -> Result<()> {
    init_logging();
    let config = test_config("archive", 2);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    let victim = store.store_with_importance(&["cold"], r#""c""#, 10)?;
    store.store_with_importance(&["warm"], r#""w""#, 50)?;
    store.store_with_importance(&["hot"], r#""h""#, 90)?;
    assert_eq!(store.stats().disk, 1);

    store.apply_directive(Directive::Archive { key: victim })?;

    let working = store.query(&QueryCriteria {
        layer: Some(Layer::Working),
        ..QueryCriteria::default()
    })?;
    assert_eq!(working.len(), 2);
    assert!(working.iter().all(|h| h.key_id != victim));
    assert_eq!(store.stats().archived, 1);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_budget_invariant_after_promote() -> Result<()> {
    init_logging();
    let config = test_config("invariant", 3);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    for i in 0..6 {
        store.store_with_importance(
            &[format!("entry{}", i)],
            &format!(r#""value {}""#, i),
            (i * 10) as u32,
        )?;
        assert!(store.stats().working <= 3);
    }

    // Promoting from disk demotes something else, never exceeds the budget
    store.retrieve_promote(&["entry0"])?;
    let stats = store.stats();
    assert!(stats.working <= 3);
    assert_eq!(stats.total_entries, 6);

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_directive_batch_from_wire_form() -> Result<()> {
    init_logging();
    let config = test_config("wire", 8);
    let path = config.snapshot_path.clone();
    cleanup(&path);

    let store = TagStore::open(config)?;
    let a = store.store(&["a"], r#""1""#)?;
    let b = store.store(&["b"], r#""2""#)?;

    let batch = Directive::parse_batch(&format!(
        r#"[
            {{"kind": "move_to_disk", "key": {}}},
            {{"kind": "set_importance", "key": {}, "importance": 95}},
            {{"kind": "delete", "key": {}}}
        ]"#,
        a.0, b.0, a.0
    ))?;
    assert_eq!(store.apply_directives(&batch)?, 3);

    let stats = store.stats();
    assert_eq!(stats.total_entries, 1);
    assert!(matches!(
        store.retrieve(&["a"]),
        Err(Error::NotFound(_))
    ));

    // Unknown keys are reported, not fatal
    let err = store.apply_directive(Directive::Delete { key: KeyId(404) });
    assert!(matches!(err, Err(Error::NotFound(_))));

    drop(store);
    cleanup(&path);
    Ok(())
}

#[test]
fn test_allocator_bound_is_exact_and_recoverable() -> Result<()> {
    init_logging();
    let mut pool = SlabPool::new(&[SizeClassConfig {
        block_size: 64,
        block_count: 4,
    }])?;

    let mut blocks = Vec::new();
    for _ in 0..4 {
        blocks.push(pool.alloc(64)?);
    }
    let err = pool.alloc(64).unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)));

    // Releasing one block makes the next allocation succeed
    pool.release(blocks.pop().unwrap())?;
    pool.alloc(64)?;
    assert_eq!(pool.blocks_in_use(), 4);
    Ok(())
}
