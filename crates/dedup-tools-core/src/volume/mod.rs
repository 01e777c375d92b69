//! Volume-independent file identity.
//!
//! A file is named by `(volume uid, path relative to the volume's mount
//! point)`, so a job database stays valid when a drive letter or mount point
//! changes between runs. The mount table is owned by a [`VolumeIdentity`]
//! value and only changes through [`VolumeIdentity::refresh`].

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
pub mod windows;

use crate::error::FileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// A volume that is currently mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub uid: String,
    pub mount_point: PathBuf,
}

/// The portable name of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub uid: String,
    /// `/`-separated path below the volume's mount point.
    pub relative_path: String,
}

impl FileIdentity {
    pub fn new(uid: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            relative_path: relative_path.into(),
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.relative_path)
    }
}

/// Result of mapping an absolute path onto the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Tracked(FileIdentity),
    /// No known volume contains the path; carries the normalized absolute path.
    Untracked(PathBuf),
}

impl Conversion {
    pub fn identity(self) -> Option<FileIdentity> {
        match self {
            Conversion::Tracked(id) => Some(id),
            Conversion::Untracked(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeIdentity {
    use_system_mounts: bool,
    system: Vec<Volume>,
    pseudo: Vec<Volume>,
}

impl VolumeIdentity {
    /// Mount table populated from the operating system.
    pub fn system() -> Self {
        let mut volumes = Self {
            use_system_mounts: true,
            ..Self::default()
        };
        volumes.refresh();
        volumes
    }

    /// Mount table containing only pseudo-volumes registered by the caller.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_pseudo_volume(mut self, dir: &Path) -> io::Result<Self> {
        self.add_pseudo_volume(dir)?;
        Ok(self)
    }

    /// Register a directory as a volume whose uid is its own absolute path.
    pub fn add_pseudo_volume(&mut self, dir: &Path) -> io::Result<()> {
        let mount_point = normalize(dir)?;
        if !mount_point.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("pseudo-volume {} is not a directory", mount_point.display()),
            ));
        }
        let uid = mount_point.to_string_lossy().into_owned();
        if self.pseudo.iter().all(|v| v.uid != uid) {
            debug!("Registered pseudo-volume {}", uid);
            self.pseudo.push(Volume { uid, mount_point });
        }
        Ok(())
    }

    /// Re-enumerate OS mount points. Pseudo-volumes are kept.
    pub fn refresh(&mut self) {
        if self.use_system_mounts {
            self.system = enumerate_system_volumes();
            info!("Mount table refreshed: {} volumes", self.system.len());
        }
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.pseudo.iter().chain(self.system.iter())
    }

    pub fn mount_point(&self, uid: &str) -> Option<&Path> {
        self.volumes()
            .find(|v| v.uid == uid)
            .map(|v| v.mount_point.as_path())
    }

    pub fn is_available(&self, uid: &str) -> bool {
        self.mount_point(uid).is_some()
    }

    /// Map `path` to the longest-prefix volume. Pseudo-volumes win ties.
    pub fn convert(&self, path: &Path) -> Conversion {
        let resolved = match normalize(path) {
            Ok(p) => p,
            Err(_) => path.to_path_buf(),
        };

        let best = self
            .pseudo
            .iter()
            .map(|v| (v, 1u8))
            .chain(self.system.iter().map(|v| (v, 0u8)))
            .filter(|(v, _)| resolved.starts_with(&v.mount_point))
            .max_by_key(|(v, pseudo)| (v.mount_point.components().count(), *pseudo));

        match best {
            Some((volume, _)) => {
                let rel = resolved
                    .strip_prefix(&volume.mount_point)
                    .map(to_portable)
                    .unwrap_or_default();
                Conversion::Tracked(FileIdentity::new(volume.uid.clone(), rel))
            }
            None => Conversion::Untracked(resolved),
        }
    }

    pub fn identity(&self, path: &Path) -> Option<FileIdentity> {
        self.convert(path).identity()
    }

    /// Absolute path of `id`, or `None` when its volume is not mounted.
    pub fn reconstruct(&self, id: &FileIdentity) -> Option<PathBuf> {
        let mut path = self.mount_point(&id.uid)?.to_path_buf();
        for segment in id.relative_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Some(path)
    }

    /// Like [`reconstruct`](Self::reconstruct), with an unmounted volume
    /// reported as [`FileError::Unavailable`].
    pub fn locate(&self, id: &FileIdentity) -> Result<PathBuf, FileError> {
        self.reconstruct(id).ok_or_else(|| FileError::Unavailable {
            uid: id.uid.clone(),
            relative_path: id.relative_path.clone(),
        })
    }

    pub fn is_conversion_reversible(&self, path: &Path) -> bool {
        let Some(id) = self.identity(path) else {
            return false;
        };
        match (self.reconstruct(&id), normalize(path)) {
            (Some(rebuilt), Ok(expected)) => rebuilt == expected,
            _ => false,
        }
    }
}

/// Absolute, symlink-resolved form of `path`. Paths that do not exist yet
/// (e.g. a copy target) are resolved through their deepest existing ancestor.
pub fn normalize(path: &Path) -> io::Result<PathBuf> {
    if let Ok(canonical) = fs::canonicalize(path) {
        return Ok(strip_verbatim(canonical));
    }

    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(lexical_clean(&absolute)),
        }
    }

    let mut resolved = strip_verbatim(fs::canonicalize(&existing)?);
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(lexical_clean(&resolved))
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn to_portable(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(target_os = "windows")]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    windows::strip_verbatim_prefix(path)
}

#[cfg(not(target_os = "windows"))]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    path
}

#[cfg(target_os = "linux")]
fn enumerate_system_volumes() -> Vec<Volume> {
    linux::enumerate()
}

#[cfg(target_os = "windows")]
fn enumerate_system_volumes() -> Vec<Volume> {
    windows::enumerate()
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn enumerate_system_volumes() -> Vec<Volume> {
    debug!("No mount enumeration on this platform; only pseudo-volumes are tracked");
    Vec::new()
}

/// Whether `a` and `b` live on the same device, so a rename can move data
/// between them without copying.
#[cfg(unix)]
pub fn same_device(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev(),
        _ => false,
    }
}

#[cfg(target_os = "windows")]
pub fn same_device(a: &Path, b: &Path) -> bool {
    match (windows::get_drive_letter(a), windows::get_drive_letter(b)) {
        (Some(da), Some(db)) => da.eq_ignore_ascii_case(&db),
        _ => false,
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn same_device(_a: &Path, _b: &Path) -> bool {
    false
}
