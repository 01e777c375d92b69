use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

use dedup_tools_core::hasher::sha256;
use dedup_tools_core::phases::dupes_move::{analyze, execute_moves, verify_moves, Layout, MoveOptions};
use dedup_tools_core::phases::summary::dupes_move_summary;
use dedup_tools_core::scanner;
use dedup_tools_core::storage::models::{FileRole, MoveStatus};
use dedup_tools_core::storage::Database;
use dedup_tools_core::{ChecksumCache, SilentReporter, VolumeIdentity};

/// Layout:
///   pool/
///     a/one.jpg    ("dup")     keeper
///     b/one.jpg    ("dup")
///     c/two.jpg    ("dup")
///     unique.txt   ("unique")
///     x/1.bin      ("dup2")    keeper
///     y/1.bin      ("dup2")
struct Fixture {
    _tmp: TempDir,
    pool: PathBuf,
    dupes: PathBuf,
    db: Database,
    volumes: VolumeIdentity,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempdir().unwrap();
        let pool = tmp.path().join("pool");
        let dupes = tmp.path().join("dupes");
        for (rel, content) in [
            ("a/one.jpg", "dup"),
            ("b/one.jpg", "dup"),
            ("c/two.jpg", "dup"),
            ("unique.txt", "unique"),
            ("x/1.bin", "dup2"),
            ("y/1.bin", "dup2"),
        ] {
            let path = pool.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(&dupes).unwrap();
        let volumes = VolumeIdentity::empty()
            .with_pseudo_volume(&pool)
            .unwrap()
            .with_pseudo_volume(&dupes)
            .unwrap();
        let db = Database::open_in_memory().unwrap();
        scanner::scan_roots(&db, &volumes, FileRole::DedupPool, &[pool.clone()], &[], &SilentReporter)
            .unwrap();
        Self {
            _tmp: tmp,
            pool,
            dupes,
            db,
            volumes,
        }
    }

    fn options(&self, layout: Layout) -> MoveOptions {
        MoveOptions {
            dupes_dir: self.dupes.clone(),
            layout,
            threads: 4,
        }
    }
}

#[test]
fn test_plan_has_exactly_one_keeper_per_group() {
    let fx = Fixture::new();
    let cache = ChecksumCache::new(&fx.db, &fx.volumes);

    let summary = analyze(&fx.db, &cache, &fx.options(Layout::Preserve), &SilentReporter).unwrap();
    assert_eq!(summary.files, 6);
    assert_eq!(summary.groups, 2);
    assert_eq!(summary.keepers, 2);
    assert_eq!(summary.planned, 3);

    let plan = fx.db.list_move_plan(&[]).unwrap();
    let mut per_group: HashMap<&str, (usize, usize)> = HashMap::new();
    for row in &plan {
        let counts = per_group.entry(row.checksum.as_str()).or_default();
        if row.is_keeper {
            assert_eq!(row.status, MoveStatus::Keeper);
            counts.0 += 1;
        } else {
            assert_eq!(row.status, MoveStatus::Planned);
            counts.1 += 1;
        }
    }
    assert_eq!(per_group[sha256::hash_bytes(b"dup").as_str()], (1, 2));
    assert_eq!(per_group[sha256::hash_bytes(b"dup2").as_str()], (1, 1));

    // First by scan order wins.
    let keeper = fx.db.get_keeper(&sha256::hash_bytes(b"dup")).unwrap().unwrap();
    assert_eq!(keeper.identity.relative_path, "a/one.jpg");

    // Re-analysis replaces the planned rows and keeps the keepers.
    let again = analyze(&fx.db, &cache, &fx.options(Layout::Preserve), &SilentReporter).unwrap();
    assert_eq!(again.keepers, 0);
    assert_eq!(again.planned, 3);
    assert_eq!(fx.db.list_move_plan(&[]).unwrap().len(), 5);
}

#[test]
fn test_move_and_verify_leaves_only_keepers_in_pool() {
    let fx = Fixture::new();
    let cache = ChecksumCache::new(&fx.db, &fx.volumes);
    analyze(&fx.db, &cache, &fx.options(Layout::Preserve), &SilentReporter).unwrap();

    let moved = execute_moves(&fx.db, &cache, 4, &SilentReporter).unwrap();
    assert_eq!(moved.moved, 3);
    assert_eq!(moved.errors, 0);

    for rel in ["b/one.jpg", "c/two.jpg", "y/1.bin"] {
        assert!(!fx.pool.join(rel).exists(), "{} still in pool", rel);
        assert!(fx.dupes.join(rel).is_file(), "{} not in dupes", rel);
    }
    for rel in ["a/one.jpg", "x/1.bin", "unique.txt"] {
        assert!(fx.pool.join(rel).is_file(), "{} was moved", rel);
    }
    assert_eq!(fs::read_to_string(fx.dupes.join("c/two.jpg")).unwrap(), "dup");

    let verified = verify_moves(&fx.db, &cache, 4, &SilentReporter).unwrap();
    assert_eq!(verified.verified, 3);
    assert_eq!(verified.keepers, 2);
    assert_eq!(verified.errors, 0);

    let summary = dupes_move_summary(&fx.db).unwrap();
    assert_eq!(summary.count("verified"), 3);
    assert_eq!(summary.count("keeper"), 2);
    assert!(summary.problems.is_empty());

    let history = fx.db.list_move_history().unwrap();
    assert_eq!(history.iter().filter(|h| h.action == "move").count(), 3);
    assert_eq!(history.iter().filter(|h| h.action == "verify").count(), 3);

    // Nothing left to do on a rerun; re-analysis plans nothing new.
    assert_eq!(execute_moves(&fx.db, &cache, 4, &SilentReporter).unwrap().moved, 0);
    let replanned = analyze(&fx.db, &cache, &fx.options(Layout::Preserve), &SilentReporter).unwrap();
    assert_eq!(replanned.planned, 0);
}

#[test]
fn test_flatten_layout_disambiguates_name_collisions() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.pool.join("d")).unwrap();
    fs::write(fx.pool.join("d/one.jpg"), "dup").unwrap();
    scanner::scan_roots(&fx.db, &fx.volumes, FileRole::DedupPool, &[fx.pool.clone()], &[], &SilentReporter)
        .unwrap();
    let cache = ChecksumCache::new(&fx.db, &fx.volumes);

    analyze(&fx.db, &cache, &fx.options(Layout::Flatten), &SilentReporter).unwrap();
    execute_moves(&fx.db, &cache, 1, &SilentReporter).unwrap();

    let prefix = &sha256::hash_bytes(b"dup")[..8];
    assert!(fx.dupes.join("one.jpg").is_file());
    assert!(fx.dupes.join(format!("{}_one.jpg", prefix)).is_file());
    assert!(fx.dupes.join("two.jpg").is_file());
    assert!(fx.dupes.join("1.bin").is_file());
    assert!(fx.pool.join("a/one.jpg").is_file());
}

#[test]
fn test_changed_file_or_missing_keeper_blocks_the_move() {
    let fx = Fixture::new();
    let cache = ChecksumCache::new(&fx.db, &fx.volumes);
    analyze(&fx.db, &cache, &fx.options(Layout::Preserve), &SilentReporter).unwrap();

    fs::write(fx.pool.join("b/one.jpg"), "edited after planning").unwrap();
    fs::remove_file(fx.pool.join("x/1.bin")).unwrap();

    let summary = execute_moves(&fx.db, &cache, 2, &SilentReporter).unwrap();
    assert_eq!(summary.moved, 1);
    assert_eq!(summary.errors, 2);

    assert!(fx.pool.join("b/one.jpg").is_file());
    assert!(fx.pool.join("y/1.bin").is_file());
    assert!(!fx.pool.join("c/two.jpg").exists());

    let errors = fx.db.list_move_plan(&[MoveStatus::Error]).unwrap();
    let mut failed: Vec<&str> = errors.iter().map(|e| e.identity.relative_path.as_str()).collect();
    failed.sort();
    assert_eq!(failed, ["b/one.jpg", "y/1.bin"]);
    assert!(errors.iter().all(|e| e.error_message.is_some()));

    let history = fx.db.list_move_history().unwrap();
    assert_eq!(history.iter().filter(|h| h.result == "error").count(), 2);

    let summary = dupes_move_summary(&fx.db).unwrap();
    assert_eq!(summary.problems.len(), 3);
}
