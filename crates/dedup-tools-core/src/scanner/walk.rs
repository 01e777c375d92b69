use crate::error::Error;
use crate::storage::models::FileRecord;
use crate::volume::VolumeIdentity;
use glob::Pattern;
use std::path::{Component, Path};
use tracing::{debug, error, warn};
use walkdir::{DirEntry, WalkDir};

/// Counters for one walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub files: usize,
    pub bytes: u64,
    pub untracked: usize,
    pub unreadable: usize,
}

pub fn compile_patterns(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect()
}

fn is_ignored(entry: &DirEntry, patterns: &[Pattern]) -> bool {
    let name = entry.file_name().to_string_lossy();
    patterns
        .iter()
        .any(|p| p.matches(&name) || p.matches_path(entry.path()))
}

/// Walk `root` in file-name order and describe every regular file on it.
/// Symlinks are not followed and files outside any known volume are skipped.
pub fn walk_root(
    root: &Path,
    volumes: &VolumeIdentity,
    patterns: &[Pattern],
    mut on_file: impl FnMut(&FileRecord),
) -> Result<(Vec<FileRecord>, WalkStats), Error> {
    if !root.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut records = Vec::new();
    let mut stats = WalkStats::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored(entry, patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                error!("Error walking {}: {}", root.display(), err);
                stats.unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                error!("Error reading metadata for {}: {}", path.display(), err);
                stats.unreadable += 1;
                continue;
            }
        };
        let Some(identity) = volumes.identity(path) else {
            warn!("{} is not on a known volume; skipping", path.display());
            stats.untracked += 1;
            continue;
        };

        let mut record = FileRecord::from_metadata(identity, &metadata);
        record.root_relative_path = path.strip_prefix(root).ok().map(portable);
        stats.files += 1;
        stats.bytes += metadata.len();
        on_file(&record);
        records.push(record);
    }

    debug!(
        "Walked {}: {} files, {} bytes, {} untracked",
        root.display(),
        stats.files,
        stats.bytes,
        stats.untracked
    );
    Ok((records, stats))
}

fn portable(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
