//! Single-file transfer with checksums of both sides.
//!
//! Copies are streamed into a `.dedup-partial` sibling of the target while the
//! source bytes are hashed, the partial file is synced and read back from disk
//! for the destination hash, and only then renamed into place. A transfer whose
//! hashes disagree (or disagree with the caller's expected checksum) leaves
//! nothing behind at the target and never deletes the source.

use crate::error::FileError;
use crate::hasher::sha256::{self, HashingWriter, BLOCK_SIZE};
use crate::volume::same_device;
use filetime::FileTime;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PARTIAL_SUFFIX: &str = ".dedup-partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Source stays in place.
    Copy,
    /// Source is removed once the target is committed.
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Rename,
    Copy,
    CopyDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub src_checksum: String,
    pub dst_checksum: String,
    pub method: TransferMethod,
    /// Whether the target now holds the data. `false` means the checksums
    /// disagreed and the target was left untouched.
    pub committed: bool,
}

impl TransferOutcome {
    /// Source, destination and `expected` all agree.
    pub fn matches(&self, expected: &str) -> bool {
        self.committed && self.src_checksum == expected && self.dst_checksum == expected
    }
}

/// Transfer `src` to `dst`, creating parent directories as needed.
///
/// A move between paths on the same device is a rename followed by a read
/// of the renamed file; otherwise the data is copied. No retries happen here.
pub fn transfer_file(
    src: &Path,
    dst: &Path,
    mode: TransferMode,
    expected: Option<&str>,
) -> Result<TransferOutcome, FileError> {
    let src_meta = fs::metadata(src).map_err(|e| FileError::io(src, e))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
    }

    if mode == TransferMode::Move && dst.parent().is_some_and(|p| same_device(src, p)) {
        match fs::rename(src, dst) {
            Ok(()) => return finish_rename(src, dst, expected),
            Err(e) => debug!(
                "Rename {} -> {} failed ({}), falling back to copy",
                src.display(),
                dst.display(),
                e
            ),
        }
    }

    let (src_checksum, dst_checksum, committed) = copy_verified(src, dst, &src_meta, expected)?;
    let mut method = TransferMethod::Copy;
    if mode == TransferMode::Move && committed {
        fs::remove_file(src).map_err(|e| FileError::io(src, e))?;
        method = TransferMethod::CopyDelete;
    }
    Ok(TransferOutcome {
        src_checksum,
        dst_checksum,
        method,
        committed,
    })
}

fn finish_rename(
    src: &Path,
    dst: &Path,
    expected: Option<&str>,
) -> Result<TransferOutcome, FileError> {
    let checksum = sha256::hash_file(dst).map_err(|e| FileError::io(dst, e))?;
    let committed = expected.map_or(true, |e| e == checksum);
    if !committed {
        warn!(
            "Renamed file {} does not have the expected checksum; moving it back",
            dst.display()
        );
        fs::rename(dst, src).map_err(|e| FileError::io(dst, e))?;
    }
    Ok(TransferOutcome {
        src_checksum: checksum.clone(),
        dst_checksum: checksum,
        method: TransferMethod::Rename,
        committed,
    })
}

fn copy_verified(
    src: &Path,
    dst: &Path,
    src_meta: &fs::Metadata,
    expected: Option<&str>,
) -> Result<(String, String, bool), FileError> {
    let partial = partial_path(dst);
    let result = write_partial(src, &partial, src_meta).and_then(|src_checksum| {
        let dst_checksum = sha256::hash_file(&partial).map_err(|e| FileError::io(&partial, e))?;
        Ok((src_checksum, dst_checksum))
    });

    let (src_checksum, dst_checksum) = match result {
        Ok(sums) => sums,
        Err(e) => {
            discard(&partial);
            return Err(e);
        }
    };

    let committed =
        src_checksum == dst_checksum && expected.map_or(true, |e| e == src_checksum);
    if committed {
        replace(&partial, dst)?;
    } else {
        warn!(
            "Checksum mismatch copying {} -> {} (src {}, dst {}, expected {:?})",
            src.display(),
            dst.display(),
            src_checksum,
            dst_checksum,
            expected
        );
        discard(&partial);
    }
    Ok((src_checksum, dst_checksum, committed))
}

/// Stream `src` into `partial`, returning the hash of the bytes read.
fn write_partial(src: &Path, partial: &Path, src_meta: &fs::Metadata) -> Result<String, FileError> {
    let reader = File::open(src).map_err(|e| FileError::io(src, e))?;
    let file = File::create(partial).map_err(|e| FileError::io(partial, e))?;
    let mut writer = HashingWriter::new(file);
    // `io::copy` does not tell which side failed; report the source.
    io::copy(&mut BufReader::with_capacity(BLOCK_SIZE, reader), &mut writer)
        .map_err(|e| FileError::io(src, e))?;
    writer.flush().map_err(|e| FileError::io(partial, e))?;
    let (file, src_checksum) = writer.finish();
    file.sync_all().map_err(|e| FileError::io(partial, e))?;
    drop(file);

    filetime::set_file_mtime(partial, FileTime::from_last_modification_time(src_meta))
        .map_err(|e| FileError::io(partial, e))?;
    Ok(src_checksum)
}

/// Remove a partial file; failures are logged, the transfer result stands.
fn discard(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", partial.display(), e),
    }
}

fn replace(from: &Path, to: &Path) -> Result<(), FileError> {
    #[cfg(windows)]
    {
        if to.exists() {
            fs::remove_file(to).map_err(|e| FileError::io(to, e))?;
        }
    }
    fs::rename(from, to).map_err(|e| FileError::io(to, e))
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name: OsString = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_keeps_source_and_mtime() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, "hello").unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let dst = tmp.path().join("out/nested/dst.txt");

        let outcome = transfer_file(&src, &dst, TransferMode::Copy, None).unwrap();
        assert!(outcome.committed);
        assert_eq!(outcome.method, TransferMethod::Copy);
        assert_eq!(outcome.src_checksum, sha256::hash_bytes(b"hello"));
        assert!(outcome.matches(&sha256::hash_bytes(b"hello")));
        assert!(src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&dst).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_000_000);
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn test_expected_mismatch_leaves_no_target() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, "hello").unwrap();
        let dst = tmp.path().join("dst.txt");

        let outcome = transfer_file(&src, &dst, TransferMode::Move, Some("not-the-hash")).unwrap();
        assert!(!outcome.committed);
        assert!(src.exists());
        assert!(!dst.exists());
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn test_move_on_same_device_renames() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.bin");
        fs::write(&src, "payload").unwrap();
        let dst = tmp.path().join("moved/src.bin");

        let outcome = transfer_file(&src, &dst, TransferMode::Move, None).unwrap();
        assert!(outcome.committed);
        assert_eq!(outcome.method, TransferMethod::Rename);
        assert_eq!(outcome.src_checksum, outcome.dst_checksum);
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let tmp = tempdir().unwrap();
        let err = transfer_file(
            &tmp.path().join("absent"),
            &tmp.path().join("dst"),
            TransferMode::Copy,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[test]
    fn test_discard_tolerates_missing_and_unremovable_partials() {
        let tmp = tempdir().unwrap();
        let partial = partial_path(&tmp.path().join("dst.bin"));
        fs::write(&partial, "half").unwrap();
        discard(&partial);
        assert!(!partial.exists());
        discard(&partial);

        // remove_file refuses directories; the failure is only logged.
        let stuck = tmp.path().join("stuck.dedup-partial");
        fs::create_dir(&stuck).unwrap();
        discard(&stuck);
        assert!(stuck.is_dir());
    }

    #[test]
    fn test_failed_write_removes_partial() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src_dir");
        fs::create_dir(&src).unwrap();
        let dst = tmp.path().join("dst.bin");
        let meta = fs::metadata(&src).unwrap();

        assert!(copy_verified(&src, &dst, &meta, None).is_err());
        assert!(!partial_path(&dst).exists());
        assert!(!dst.exists());
    }
}
