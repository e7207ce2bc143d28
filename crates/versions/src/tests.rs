use super::*;

fn mgr() -> VersionManager {
    VersionManager::new(VersionManagerConfig::default())
}

#[test]
fn versions_are_dense_and_start_at_one() {
    let m = mgr();
    m.create_version(b"alice", b"100".to_vec());
    m.create_version(b"alice", b"150".to_vec());
    let hist = m.get_history(b"alice", None, None);
    assert_eq!(hist.len(), 2);
    assert_eq!(hist[0].version, 1);
    assert_eq!(hist[1].version, 2);
    assert_eq!(hist[0].value, b"100");
    assert_eq!(hist[1].value, b"150");
}

#[test]
fn hash_chain_links_to_previous_version() {
    let m = mgr();
    let v1 = m.create_version(b"alice", b"100".to_vec());
    let v2 = m.create_version(b"alice", b"150".to_vec());
    assert!(v1.prev_hash.is_none());
    assert_eq!(v2.prev_hash, v1.hash);
}

#[test]
fn get_version_binary_searches_by_number() {
    let m = mgr();
    for i in 0..10 {
        m.create_version(b"k", format!("v{i}").into_bytes());
    }
    let v5 = m.get_version(b"k", 5).unwrap();
    assert_eq!(v5.value, b"v4");
    assert!(m.get_version(b"k", 99).is_none());
}

#[test]
fn get_at_time_returns_last_version_not_after_ts() {
    let m = mgr();
    m.create_version(b"k", b"a".to_vec());
    let mid = now_as_secs();
    std::thread::sleep(std::time::Duration::from_millis(2));
    m.create_version(b"k", b"b".to_vec());
    let v = m.get_at_time(b"k", mid).unwrap();
    assert_eq!(v.value, b"a");
}

#[test]
fn batch_create_skips_prev_hash_above_threshold() {
    let m = VersionManager::new(VersionManagerConfig { skip_prev_hash_threshold: 2 });
    let items = vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ];
    let versions = m.create_versions_batch(items);
    assert_eq!(versions.len(), 3);
    for v in &versions {
        assert!(v.prev_hash.is_none());
        assert!(v.hash.is_none());
    }
}

#[test]
fn batch_create_below_threshold_keeps_chain() {
    let m = VersionManager::new(VersionManagerConfig { skip_prev_hash_threshold: 100 });
    let items = vec![(b"a".to_vec(), b"1".to_vec()), (b"a".to_vec(), b"2".to_vec())];
    // batched items target distinct keys normally; here we exercise repeated keys
    // within one batch call to check intra-batch chaining still occurs.
    let items2 = vec![(b"z".to_vec(), b"1".to_vec())];
    let _ = m.create_versions_batch(items);
    let v = m.create_versions_batch(items2);
    assert!(v[0].prev_hash.is_none());
}

#[test]
fn batch_create_gives_repeated_key_strictly_increasing_timestamps() {
    let m = mgr();
    let items = vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"a".to_vec(), b"2".to_vec()),
        (b"a".to_vec(), b"3".to_vec()),
    ];
    let versions = m.create_versions_batch(items);
    assert_eq!(versions.len(), 3);
    assert!(versions[0].timestamp < versions[1].timestamp);
    assert!(versions[1].timestamp < versions[2].timestamp);
    assert_eq!(versions[1].prev_hash, versions[0].hash);
    assert_eq!(versions[2].prev_hash, versions[1].hash);

    let hist = m.get_history(b"a", None, None);
    assert_eq!(hist.len(), 3);
    assert_eq!(hist[0].version, 1);
    assert_eq!(hist[2].version, 3);
}

#[test]
fn snapshot_round_trips_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let m = mgr();
    m.create_version(b"alice", b"100".to_vec());
    m.create_version(b"alice", b"150".to_vec());
    m.create_version(b"bob", b"x".to_vec());
    m.save_to_disk(dir.path()).unwrap();

    let loaded = mgr();
    loaded.load_from_disk(dir.path()).unwrap();

    assert_eq!(loaded.get_all_keys().len(), 2);
    assert_eq!(loaded.get_history(b"alice", None, None), m.get_history(b"alice", None, None));
    assert_eq!(loaded.get_current_version(b"bob"), 1);
}

#[test]
fn corrupt_checksum_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let m = mgr();
    m.create_version(b"k", b"v".to_vec());
    m.save_to_disk(dir.path()).unwrap();

    let path = dir.path().join("versions.ver");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let loaded = mgr();
    assert!(matches!(loaded.load_from_disk(dir.path()), Err(VersionError::ChecksumMismatch)));
}

#[test]
fn loading_missing_file_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let m = mgr();
    assert!(m.load_from_disk(dir.path()).is_ok());
    assert_eq!(m.get_all_keys().len(), 0);
}
