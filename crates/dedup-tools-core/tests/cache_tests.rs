use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

use dedup_tools_core::hasher::sha256;
use dedup_tools_core::storage::models::{FileRecord, FileRole};
use dedup_tools_core::storage::Database;
use dedup_tools_core::{ChecksumCache, Error, FileIdentity, VolumeIdentity};

fn write_with_mtime(path: &Path, content: &str, mtime: i64) {
    fs::write(path, content).unwrap();
    set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

#[test]
fn test_second_lookup_is_a_cache_hit() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("a.txt");
    write_with_mtime(&file, "hello world", 1_700_000_000);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
    let cache = ChecksumCache::new(&db, &volumes);

    let first = cache.get_or_compute_with_invalidation(&file).unwrap().unwrap();
    assert_eq!(first, sha256::hash_bytes(b"hello world"));
    assert_eq!(cache.hashes_computed(), 1);

    let second = cache.get_or_compute_with_invalidation(&file).unwrap().unwrap();
    assert_eq!(second, first);
    assert_eq!(cache.hashes_computed(), 1);
}

#[test]
fn test_modified_file_is_rehashed_once() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("a.txt");
    write_with_mtime(&file, "before", 1_700_000_000);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
    let cache = ChecksumCache::new(&db, &volumes);
    let before = cache.get_or_compute_with_invalidation(&file).unwrap().unwrap();

    write_with_mtime(&file, "after!", 1_700_000_100);
    let after = cache.get_or_compute_with_invalidation(&file).unwrap().unwrap();
    assert_ne!(before, after);
    assert_eq!(cache.hashes_computed(), 2);

    cache.get_or_compute_with_invalidation(&file).unwrap();
    assert_eq!(cache.hashes_computed(), 2);
}

#[test]
fn test_same_size_and_mtime_is_trusted() {
    // Staleness is detected from size and mtime only.
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("a.txt");
    write_with_mtime(&file, "aaaa", 1_700_000_000);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
    let cache = ChecksumCache::new(&db, &volumes);
    let original = cache.get_or_compute_with_invalidation(&file).unwrap();

    write_with_mtime(&file, "bbbb", 1_700_000_000);
    assert_eq!(cache.get_or_compute_with_invalidation(&file).unwrap(), original);
    assert_ne!(cache.recompute(&file).unwrap(), original);
}

#[test]
fn test_pool_lookup_invalidates_changed_candidate() {
    let tmp = tempdir().unwrap();
    let first = tmp.path().join("one.bin");
    let second = tmp.path().join("two.bin");
    write_with_mtime(&first, "same", 1_700_000_000);
    write_with_mtime(&second, "same", 1_700_000_000);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
    let cache = ChecksumCache::new(&db, &volumes);

    let records: Vec<FileRecord> = [&first, &second]
        .iter()
        .map(|p| FileRecord::from_metadata(volumes.identity(p).unwrap(), &fs::metadata(p).unwrap()))
        .collect();
    db.upsert_file_records(FileRole::DestinationPool, &records).unwrap();
    let checksum = cache.get_or_compute_with_invalidation(&first).unwrap().unwrap();
    cache.get_or_compute_with_invalidation(&second).unwrap();

    assert!(cache.exists_at_destination_pool(&checksum).unwrap());

    // First candidate changes behind the cache's back; the second still holds the content.
    write_with_mtime(&first, "different", 1_700_000_500);
    let found = cache
        .find_valid_in_role(FileRole::DestinationPool, &checksum)
        .unwrap();
    assert_eq!(found, Some(records[1].identity.clone()));
    assert_eq!(cache.get(&records[0].identity).unwrap(), None);
    assert!(!cache.entry(&records[0].identity).unwrap().unwrap().is_valid);

    fs::remove_file(&second).unwrap();
    assert!(!cache.exists_at_destination_pool(&checksum).unwrap());
    assert_eq!(cache.get(&records[1].identity).unwrap(), None);
}

#[test]
fn test_export_then_import_seeds_another_job() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).unwrap();
    let file = data.join("a.txt");
    write_with_mtime(&file, "shared", 1_700_000_000);

    let first_db = Database::open(&tmp.path().join("first.db"), &tmp.path().join("first-cache.db")).unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(&data).unwrap();
    let first = ChecksumCache::new(&first_db, &volumes);
    let checksum = first.get_or_compute_with_invalidation(&file).unwrap().unwrap();

    let exported = tmp.path().join("export.db");
    first.export_to(&exported).unwrap();
    assert!(exported.is_file());

    let second_db = Database::open_in_memory().unwrap();
    let second = ChecksumCache::new(&second_db, &volumes);
    assert_eq!(second.import_from(&exported).unwrap(), 1);

    let id = volumes.identity(&file).unwrap();
    assert_eq!(second.get(&id).unwrap(), Some(checksum.clone()));
    assert!(second.entry(&id).unwrap().unwrap().imported_at.is_some());
    assert_eq!(second.get_or_compute_with_invalidation(&file).unwrap(), Some(checksum));
    assert_eq!(second.hashes_computed(), 0);
}

#[test]
fn test_import_without_cache_table_is_rejected() {
    let tmp = tempdir().unwrap();
    let foreign = tmp.path().join("foreign.db");
    let conn = rusqlite::Connection::open(&foreign).unwrap();
    conn.execute_batch("CREATE TABLE unrelated (id INTEGER PRIMARY KEY);").unwrap();
    drop(conn);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty();
    let cache = ChecksumCache::new(&db, &volumes);

    match cache.import_from(&foreign) {
        Err(Error::MissingTable { table, .. }) => assert_eq!(table, "checksum_cache"),
        other => panic!("expected MissingTable, got {:?}", other),
    }
    assert!(cache.import_from(&tmp.path().join("absent.db")).is_err());
}

#[test]
fn test_exists_at_destination_checks_catalog_and_disk() {
    let tmp = tempdir().unwrap();
    let copied = tmp.path().join("copied.bin");
    let stray = tmp.path().join("stray.bin");
    write_with_mtime(&copied, "payload", 1_700_000_000);
    write_with_mtime(&stray, "payload", 1_700_000_000);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
    let cache = ChecksumCache::new(&db, &volumes);

    let copied_id = volumes.identity(&copied).unwrap();
    let record = FileRecord::from_metadata(copied_id.clone(), &fs::metadata(&copied).unwrap());
    db.upsert_file_records(FileRole::Destination, &[record]).unwrap();
    cache.get_or_compute_with_invalidation(&copied).unwrap();
    cache.get_or_compute_with_invalidation(&stray).unwrap();

    assert!(cache.exists_at_destination(&copied_id).unwrap());
    // Cached but never catalogued as a destination file.
    assert!(!cache.exists_at_destination(&volumes.identity(&stray).unwrap()).unwrap());

    write_with_mtime(&copied, "overwritten", 1_700_000_900);
    assert!(!cache.exists_at_destination(&copied_id).unwrap());
    assert!(!cache.entry(&copied_id).unwrap().unwrap().is_valid);
    assert_eq!(cache.get(&copied_id).unwrap(), None);
}

#[test]
fn test_import_spanning_several_batches() {
    let tmp = tempdir().unwrap();
    let foreign = tmp.path().join("foreign.db");
    let conn = rusqlite::Connection::open(&foreign).unwrap();
    conn.execute_batch(
        "CREATE TABLE checksum_cache (
             uid TEXT NOT NULL,
             relative_path TEXT NOT NULL,
             size INTEGER,
             last_modified INTEGER,
             checksum TEXT,
             last_validated INTEGER,
             is_valid INTEGER,
             PRIMARY KEY (uid, relative_path)
         );
         WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 12000)
         INSERT INTO checksum_cache (uid, relative_path, size, last_modified, checksum)
         SELECT 'vol-1', 'dir/file_' || i || '.bin', i, 1700000000 + i, printf('%064d', i) FROM n;
         INSERT INTO checksum_cache (uid, relative_path, size, last_modified, checksum)
         VALUES ('vol-1', 'never/hashed.bin', 1, 1, NULL);",
    )
    .unwrap();
    drop(conn);

    let db = Database::open_in_memory().unwrap();
    let volumes = VolumeIdentity::empty();
    let cache = ChecksumCache::new(&db, &volumes);
    assert_eq!(cache.import_from(&foreign).unwrap(), 12_000);

    for i in [1, 5_000, 5_001, 12_000] {
        let id = FileIdentity::new("vol-1", format!("dir/file_{}.bin", i));
        let entry = cache.entry(&id).unwrap().unwrap();
        assert_eq!(entry.checksum, format!("{:064}", i));
        assert_eq!(entry.size, i as i64);
        assert!(entry.is_valid);
    }
    let unhashed = FileIdentity::new("vol-1", "never/hashed.bin");
    assert!(cache.entry(&unhashed).unwrap().is_none());
}
