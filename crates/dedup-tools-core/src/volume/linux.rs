use super::Volume;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BY_UUID_DIR: &str = "/dev/disk/by-uuid";
const PROC_MOUNTS: &str = "/proc/mounts";

/// Volumes with a filesystem UUID, keyed to their first (primary) mount point.
pub(super) fn enumerate() -> Vec<Volume> {
    let uuids = read_uuid_links(Path::new(BY_UUID_DIR));
    let content = match fs::read_to_string(PROC_MOUNTS) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", PROC_MOUNTS, e);
            return Vec::new();
        }
    };

    let mut volumes: Vec<Volume> = Vec::new();
    for (device, mount_point) in parse_mounts(&content) {
        let device = fs::canonicalize(&device).unwrap_or_else(|_| PathBuf::from(&device));
        let Some(uid) = uuids.get(&device) else {
            continue;
        };
        // Later entries for the same filesystem are bind mounts of subtrees.
        if volumes.iter().any(|v| &v.uid == uid) {
            continue;
        }
        volumes.push(Volume {
            uid: uid.clone(),
            mount_point,
        });
    }
    debug!("Found {} UUID-backed mounts", volumes.len());
    volumes
}

/// Device node -> filesystem UUID, from the udev symlink directory.
fn read_uuid_links(dir: &Path) -> HashMap<PathBuf, String> {
    let mut map = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return map;
    };
    for entry in entries.flatten() {
        let uuid = entry.file_name().to_string_lossy().into_owned();
        if let Ok(device) = fs::canonicalize(entry.path()) {
            map.insert(device, uuid);
        }
    }
    map
}

/// `(device, mount point)` pairs from `/proc/mounts`-formatted text.
pub(super) fn parse_mounts(content: &str) -> Vec<(String, PathBuf)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            Some((unescape_octal(device), PathBuf::from(unescape_octal(mount_point))))
        })
        .collect()
}

/// `\040` -> space, `\011` -> tab, as the kernel escapes mount fields.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
