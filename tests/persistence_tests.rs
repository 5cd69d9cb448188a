use futures::executor::block_on;
use pulse_core::*;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn populated_store() -> Arc<MemoryDocumentStore> {
    let store = Arc::new(MemoryDocumentStore::new());
    let writer = ChunkWriter::new(store.clone(), &CoreConfig::default()).unwrap();
    let meta = writer
        .register_series("boilers", "b1/temp", DataType::Double, 1000)
        .unwrap();
    let points: BTreeMap<_, _> = [
        (1_000, Value::Double(1.0)),
        (1_500_000, Value::Double(2.0)),
    ]
    .into();
    let batches: BTreeMap<_, _> = [(1_000, "import-1".to_string())].into();
    block_on(writer.write_async(meta, points, Some(batches))).unwrap();
    store
}

#[test]
fn test_snapshot_round_trip() {
    let dir = tempdir().unwrap();
    let snapshotter = Snapshotter::new(dir.path()).unwrap();
    assert!(snapshotter.load_latest_snapshot().unwrap().is_none());

    let store = populated_store();
    snapshotter.create_snapshot(&store, 100).unwrap();
    let path = snapshotter.create_snapshot(&store, 200).unwrap();
    assert!(path.ends_with("snapshot_200.bin"));
    assert_eq!(snapshotter.latest_snapshot_timestamp().unwrap(), Some(200));

    let restored = Arc::new(snapshotter.load_latest_snapshot().unwrap().unwrap());
    assert_eq!(restored.image().unwrap(), store.image().unwrap());

    let engine = ChunkQueryEngine::new(restored, &CoreConfig::default()).unwrap();
    let matrix = engine.extract(&["b1/temp".to_string()], 0, 2_048_000).unwrap();
    assert_eq!(matrix["boilers"]["b1/temp"].len(), 2);
}

#[test]
fn test_corrupted_snapshot_is_detected() {
    let dir = tempdir().unwrap();
    let snapshotter = Snapshotter::new(dir.path()).unwrap();
    let path = snapshotter.create_snapshot(&populated_store(), 1).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    assert!(matches!(
        snapshotter.load_latest_snapshot(),
        Err(PulseError::Corruption(_))
    ));
}

#[test]
fn test_leftover_temp_files_are_ignored() {
    let dir = tempdir().unwrap();
    let snapshotter = Snapshotter::new(dir.path()).unwrap();
    fs::write(dir.path().join(".tmp_snapshot_999.bin"), b"partial").unwrap();
    assert_eq!(snapshotter.latest_snapshot_timestamp().unwrap(), None);

    snapshotter.create_snapshot(&populated_store(), 5).unwrap();
    assert_eq!(snapshotter.latest_snapshot_timestamp().unwrap(), Some(5));
    assert!(snapshotter.load_latest_snapshot().unwrap().is_some());
}
