use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

use dedup_tools_core::phases::checksum::{ensure_checksums, index_pool};
use dedup_tools_core::phases::copy::{run_copy, CopyOptions, CopySummary};
use dedup_tools_core::phases::verify::{run_verify, VerifyOptions, VerifySummary};
use dedup_tools_core::scanner;
use dedup_tools_core::storage::models::{
    CopyStatus, CopyStatusRow, FileRole, VerifyStage, VerifyStatus,
};
use dedup_tools_core::storage::Database;
use dedup_tools_core::{ChecksumCache, SilentReporter, VolumeIdentity};

struct Fixture {
    _tmp: TempDir,
    src: PathBuf,
    dst: PathBuf,
    db: Database,
}

impl Fixture {
    fn new() -> Self {
        Self::with_db(|_| Database::open_in_memory().unwrap())
    }

    /// Job store on disk, one connection per call.
    fn per_call() -> Self {
        Self::with_db(|dir| {
            Database::open_per_call(&dir.join("job.db"), &dir.join("cache.db")).unwrap()
        })
    }

    fn with_db(open: impl FnOnce(&Path) -> Database) -> Self {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        let db = open(tmp.path());
        Self {
            _tmp: tmp,
            src,
            dst,
            db,
        }
    }

    fn volumes(&self) -> VolumeIdentity {
        VolumeIdentity::empty()
            .with_pseudo_volume(&self.src)
            .unwrap()
            .with_pseudo_volume(&self.dst)
            .unwrap()
    }

    fn write_source(&self, rel: &str, content: &str) {
        let path = self.src.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn copy(&self, volumes: &VolumeIdentity, threads: usize) -> CopySummary {
        self.copy_roots(volumes, &[self.src.clone()], threads)
    }

    fn copy_roots(&self, volumes: &VolumeIdentity, roots: &[PathBuf], threads: usize) -> CopySummary {
        let cache = ChecksumCache::new(&self.db, volumes);
        scanner::scan_roots(&self.db, volumes, FileRole::Source, roots, &[], &SilentReporter).unwrap();
        ensure_checksums(&self.db, &cache, FileRole::Source, threads, &SilentReporter).unwrap();
        let options = CopyOptions {
            dest_roots: vec![self.dst.clone()],
            threads,
        };
        run_copy(&self.db, &cache, &options, &SilentReporter).unwrap()
    }

    fn verify(&self, volumes: &VolumeIdentity, stage: VerifyStage) -> VerifySummary {
        let cache = ChecksumCache::new(&self.db, volumes);
        let options = VerifyOptions {
            stage,
            reverify: true,
            threads: 2,
        };
        run_verify(&self.db, &cache, &options, &SilentReporter).unwrap()
    }

    fn status_of(&self, volumes: &VolumeIdentity, rel: &str) -> CopyStatus {
        self.row_of(volumes, &self.src.join(rel)).status
    }

    fn row_of(&self, volumes: &VolumeIdentity, source: &Path) -> CopyStatusRow {
        let id = volumes.identity(source).unwrap();
        self.db.get_copy_status(&id).unwrap().unwrap()
    }

    /// Content of the destination file the copy row of `source` points at.
    fn dest_content(&self, volumes: &VolumeIdentity, source: &Path) -> String {
        let dest = self.row_of(volumes, source).dest.unwrap();
        fs::read_to_string(volumes.reconstruct(&dest).unwrap()).unwrap()
    }
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(files_under(&path));
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    files_under(dir)
        .into_iter()
        .map(|p| {
            let content = fs::read(&p).unwrap();
            (p, content)
        })
        .collect()
}

#[test]
fn test_duplicate_content_is_copied_once_and_deep_verify_catches_corruption() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "x");
    fx.write_source("b.txt", "x");
    fx.write_source("c.txt", "y");
    let volumes = fx.volumes();

    let summary = fx.copy(&volumes, 1);
    assert_eq!(summary.copied, 2);
    assert_eq!(summary.deduplicated, 1);
    assert_eq!(summary.errors, 0);

    let copies = files_under(&fx.dst);
    assert_eq!(copies.len(), 2);
    let x_copies = copies
        .iter()
        .filter(|p| fs::read_to_string(p).unwrap() == "x")
        .count();
    assert_eq!(x_copies, 1);
    assert_eq!(fs::read_to_string(fx.dst.join("c.txt")).unwrap(), "y");
    assert!(fx.src.join("a.txt").exists() && fx.src.join("b.txt").exists());

    for rel in ["a.txt", "b.txt", "c.txt"] {
        assert_eq!(fx.status_of(&volumes, rel), CopyStatus::Done);
    }
    assert_eq!(fx.verify(&volumes, VerifyStage::Deep).ok, 3);

    fs::write(fx.dst.join("c.txt"), "z").unwrap();
    let deep = fx.verify(&volumes, VerifyStage::Deep);
    assert_eq!(deep.ok, 2);
    assert_eq!(deep.failed, 1);

    let c_id = volumes.identity(&fx.src.join("c.txt")).unwrap();
    let result = fx
        .db
        .list_deep_results()
        .unwrap()
        .into_iter()
        .find(|r| r.identity == c_id)
        .unwrap();
    assert_eq!(result.status, VerifyStatus::Failed);
    assert!(!result.checksum_matched);
    assert_eq!(fx.status_of(&volumes, "c.txt"), CopyStatus::Error);
}

#[test]
fn test_content_already_in_destination_pool_is_not_written() {
    let fx = Fixture::new();
    fx.write_source("photos/photo.jpg", "jpeg bytes");
    let pool = fx.dst.join("archive/2019");
    fs::create_dir_all(&pool).unwrap();
    fs::write(pool.join("IMG_0001.jpg"), "jpeg bytes").unwrap();
    let volumes = fx.volumes();

    let cache = ChecksumCache::new(&fx.db, &volumes);
    let (scanned, checksummed) = index_pool(
        &fx.db,
        &cache,
        FileRole::DestinationPool,
        &[pool.clone()],
        &[],
        2,
        &SilentReporter,
    )
    .unwrap();
    assert_eq!(scanned.files, 1);
    assert_eq!(checksummed.hashed, 1);

    let before = snapshot(&fx.dst);
    let summary = fx.copy(&volumes, 2);
    assert_eq!(summary.copied, 0);
    assert_eq!(summary.bytes_copied, 0);
    assert_eq!(summary.deduplicated, 1);
    assert_eq!(snapshot(&fx.dst), before);

    let id = volumes.identity(&fx.src.join("photos/photo.jpg")).unwrap();
    let row = fx.db.get_copy_status(&id).unwrap().unwrap();
    assert_eq!(row.status, CopyStatus::Done);
    assert_eq!(row.dest, volumes.identity(&pool.join("IMG_0001.jpg")));

    assert_eq!(fx.verify(&volumes, VerifyStage::Shallow).ok, 1);
}

#[test]
fn test_second_run_changes_nothing() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    fx.write_source("nested/b.txt", "beta");
    fx.write_source("nested/deeper/c.txt", "alpha");
    let volumes = fx.volumes();

    let first = fx.copy(&volumes, 4);
    assert_eq!(first.copied, 2);
    fx.verify(&volumes, VerifyStage::Shallow);
    let tree = snapshot(&fx.dst);
    let statuses = fx.db.list_copy_status(None).unwrap();

    let second = fx.copy(&volumes, 4);
    assert_eq!(second, CopySummary::default());
    let shallow = fx.verify(&volumes, VerifyStage::Shallow);
    assert_eq!(shallow.ok, 3);
    assert_eq!(shallow.failed, 0);

    assert_eq!(snapshot(&fx.dst), tree);
    let after: Vec<_> = fx
        .db
        .list_copy_status(None)
        .unwrap()
        .into_iter()
        .map(|r| (r.identity, r.status, r.checksum, r.dest))
        .collect();
    let before: Vec<_> = statuses
        .into_iter()
        .map(|r| (r.identity, r.status, r.checksum, r.dest))
        .collect();
    assert_eq!(after, before);
}

#[test]
fn test_missing_destination_copy_is_recopied() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    fx.write_source("b.txt", "beta");
    let volumes = fx.volumes();
    fx.copy(&volumes, 2);

    fs::remove_file(fx.dst.join("b.txt")).unwrap();
    let summary = fx.copy(&volumes, 2);
    assert_eq!(summary.reconciled, 1);
    assert_eq!(summary.copied, 1);
    assert_eq!(fs::read_to_string(fx.dst.join("b.txt")).unwrap(), "beta");
    assert_eq!(fx.status_of(&volumes, "b.txt"), CopyStatus::Done);
}

#[test]
fn test_many_threads_copy_each_content_once() {
    let fx = Fixture::new();
    for i in 0..24 {
        fx.write_source(&format!("dir{}/same_{}.bin", i % 4, i), "shared payload");
    }
    for i in 0..6 {
        fx.write_source(&format!("unique_{}.bin", i), &format!("unique payload {}", i));
    }
    let volumes = fx.volumes();

    let summary = fx.copy(&volumes, 8);
    assert_eq!(summary.copied, 7);
    assert_eq!(summary.deduplicated, 23);
    assert_eq!(summary.errors, 0);

    let shared = files_under(&fx.dst)
        .into_iter()
        .filter(|p| fs::read_to_string(p).unwrap() == "shared payload")
        .count();
    assert_eq!(shared, 1);
    assert_eq!(
        fx.db.list_copy_status(Some(CopyStatus::Done)).unwrap().len(),
        30
    );
}

#[test]
fn test_shallow_mismatch_is_retried_by_next_copy() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    let volumes = fx.volumes();
    fx.copy(&volumes, 1);

    fs::write(fx.dst.join("a.txt"), "tampered with").unwrap();
    let shallow = fx.verify(&volumes, VerifyStage::Shallow);
    assert_eq!(shallow.failed, 1);
    let result = &fx.db.list_shallow_results().unwrap()[0];
    assert_eq!(result.status, VerifyStatus::Mismatch);
    assert!(result.exists);
    assert!(!result.size_matched);
    assert_eq!(fx.status_of(&volumes, "a.txt"), CopyStatus::Error);

    let summary = fx.copy(&volumes, 1);
    assert_eq!(summary.copied, 1);
    assert_eq!(fs::read_to_string(fx.dst.join("a.txt")).unwrap(), "alpha");
    assert_eq!(fx.verify(&volumes, VerifyStage::Shallow).ok, 1);
}

#[test]
fn test_foreign_file_at_target_is_not_overwritten() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    fs::write(fx.dst.join("a.txt"), "somebody else's file").unwrap();
    let volumes = fx.volumes();

    let summary = fx.copy(&volumes, 1);
    assert_eq!(summary.copied, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(
        fs::read_to_string(fx.dst.join("a.txt")).unwrap(),
        "somebody else's file"
    );
    let row = fx.row_of(&volumes, &fx.src.join("a.txt"));
    assert_eq!(row.status, CopyStatus::Done);
    assert_ne!(row.dest, volumes.identity(&fx.dst.join("a.txt")));
    assert_eq!(fx.dest_content(&volumes, &fx.src.join("a.txt")), "alpha");
    assert_eq!(files_under(&fx.dst).len(), 2);
}

#[test]
fn test_changed_source_does_not_overwrite_shared_copy() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "x");
    fx.write_source("b.txt", "x");
    let volumes = fx.volumes();
    let first = fx.copy(&volumes, 1);
    assert_eq!((first.copied, first.deduplicated), (1, 1));

    // The source whose name the single copy took, and the one deduplicated onto it.
    let shared = fx.row_of(&volumes, &fx.src.join("a.txt")).dest.unwrap();
    let (owner, other) = if shared.relative_path == "a.txt" {
        (fx.src.join("a.txt"), fx.src.join("b.txt"))
    } else {
        (fx.src.join("b.txt"), fx.src.join("a.txt"))
    };
    fs::write(&owner, "changed").unwrap();

    let second = fx.copy(&volumes, 1);
    assert_eq!(second.copied, 1);
    assert_eq!(second.reconciled, 0);
    assert_eq!(fx.copy(&volumes, 1), CopySummary::default());

    let other_row = fx.row_of(&volumes, &other);
    assert_eq!(other_row.status, CopyStatus::Done);
    assert_eq!(other_row.dest.as_ref(), Some(&shared));
    assert_eq!(fx.dest_content(&volumes, &other), "x");

    let owner_row = fx.row_of(&volumes, &owner);
    assert_eq!(owner_row.status, CopyStatus::Done);
    assert_ne!(owner_row.dest.as_ref(), Some(&shared));
    assert_eq!(fx.dest_content(&volumes, &owner), "changed");
    assert_eq!(files_under(&fx.dst).len(), 2);
    assert_eq!(fx.verify(&volumes, VerifyStage::Deep).ok, 2);
}

#[test]
fn test_same_relative_path_on_two_volumes_gets_two_copies() {
    for threads in [1, 4] {
        let fx = Fixture::new();
        let second_src = fx.src.with_file_name("src2");
        fs::create_dir_all(second_src.join("docs")).unwrap();
        fx.write_source("docs/a.txt", "one");
        fs::write(second_src.join("docs/a.txt"), "two").unwrap();
        let volumes = fx.volumes().with_pseudo_volume(&second_src).unwrap();

        let summary = fx.copy_roots(&volumes, &[fx.src.clone(), second_src.clone()], threads);
        assert_eq!(summary.copied, 2, "threads = {}", threads);
        assert_eq!(summary.errors, 0);

        let copies = files_under(&fx.dst);
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|p| p.parent() == Some(fx.dst.join("docs").as_path())));
        assert_eq!(fx.dest_content(&volumes, &fx.src.join("docs/a.txt")), "one");
        assert_eq!(fx.dest_content(&volumes, &second_src.join("docs/a.txt")), "two");
        assert_eq!(fx.verify(&volumes, VerifyStage::Deep).ok, 2);
    }
}

#[test]
fn test_per_call_store_with_parallel_workers() {
    let fx = Fixture::per_call();
    for i in 0..12 {
        fx.write_source(&format!("dir{}/copy_{}.bin", i % 3, i), "same bytes");
        fx.write_source(&format!("dir{}/own_{}.bin", i % 3, i), &format!("own bytes {}", i));
    }
    let volumes = fx.volumes();

    let summary = fx.copy(&volumes, 4);
    assert_eq!(summary.copied, 13);
    assert_eq!(summary.deduplicated, 11);
    assert_eq!(summary.errors, 0);
    assert_eq!(files_under(&fx.dst).len(), 13);
    assert_eq!(
        fx.db.list_copy_status(Some(CopyStatus::Done)).unwrap().len(),
        24
    );

    assert_eq!(fx.copy(&volumes, 4), CopySummary::default());
    assert_eq!(fx.verify(&volumes, VerifyStage::Deep).ok, 24);
}

#[test]
fn test_deep_failure_on_destination_only_is_recopied() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    fx.write_source("c.txt", "gamma");
    let volumes = fx.volumes();
    fx.copy(&volumes, 2);

    fs::write(fx.dst.join("c.txt"), "gamma, but corrupted").unwrap();
    let deep = fx.verify(&volumes, VerifyStage::Deep);
    assert_eq!((deep.ok, deep.failed), (1, 1));
    assert_eq!(fx.status_of(&volumes, "c.txt"), CopyStatus::Error);
    assert_eq!(fs::read_to_string(fx.src.join("c.txt")).unwrap(), "gamma");

    let summary = fx.copy(&volumes, 2);
    assert_eq!(summary.copied, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(fs::read_to_string(fx.dst.join("c.txt")).unwrap(), "gamma");
    assert_eq!(fx.status_of(&volumes, "c.txt"), CopyStatus::Done);
    assert_eq!(files_under(&fx.dst).len(), 2);

    let deep = fx.verify(&volumes, VerifyStage::Deep);
    assert_eq!((deep.ok, deep.failed), (2, 0));
}

#[test]
fn test_unmounted_source_is_skipped_not_failed() {
    let fx = Fixture::new();
    fx.write_source("a.txt", "alpha");
    let volumes = fx.volumes();
    let cache = ChecksumCache::new(&fx.db, &volumes);
    scanner::scan_roots(
        &fx.db,
        &volumes,
        FileRole::Source,
        &[fx.src.clone()],
        &[],
        &SilentReporter,
    )
    .unwrap();
    ensure_checksums(&fx.db, &cache, FileRole::Source, 1, &SilentReporter).unwrap();

    // Source volume detached between runs.
    let dest_only = VolumeIdentity::empty().with_pseudo_volume(&fx.dst).unwrap();
    let cache = ChecksumCache::new(&fx.db, &dest_only);
    let options = CopyOptions {
        dest_roots: vec![fx.dst.clone()],
        threads: 1,
    };
    let summary = run_copy(&fx.db, &cache, &options, &SilentReporter).unwrap();
    assert_eq!(summary.unavailable, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(
        fx.db.list_copy_status(Some(CopyStatus::Pending)).unwrap().len(),
        1
    );
    assert!(files_under(&fx.dst).is_empty());
}
