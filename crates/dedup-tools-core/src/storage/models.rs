use crate::volume::FileIdentity;
use serde::Serialize;
use std::fmt;
use std::fs::Metadata;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

/// Which catalog table a scanned file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRole {
    Source,
    Destination,
    DestinationPool,
    LeftPool,
    RightPool,
    DedupPool,
}

impl FileRole {
    pub fn table(self) -> &'static str {
        match self {
            FileRole::Source => "source_files",
            FileRole::Destination => "destination_files",
            FileRole::DestinationPool => "destination_pool_files",
            FileRole::LeftPool => "left_pool_files",
            FileRole::RightPool => "right_pool_files",
            FileRole::DedupPool => "dedup_files_pool",
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileRole::Source => "source",
            FileRole::Destination => "destination",
            FileRole::DestinationPool => "destination pool",
            FileRole::LeftPool => "left pool",
            FileRole::RightPool => "right pool",
            FileRole::DedupPool => "dedup pool",
        };
        f.write_str(name)
    }
}

/// Size and whole-second mtime; the pair a cached checksum is validated against.
pub fn fingerprint(metadata: &Metadata) -> (i64, i64) {
    let last_modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    (metadata.len() as i64, last_modified)
}

/// A file discovered by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub size: i64,
    pub last_modified: i64,
    /// Path below the directory the file was scanned from.
    pub root_relative_path: Option<String>,
}

impl FileRecord {
    pub fn from_metadata(identity: FileIdentity, metadata: &Metadata) -> Self {
        let (size, last_modified) = fingerprint(metadata);
        Self {
            identity,
            size,
            last_modified,
            root_relative_path: None,
        }
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

string_enum!(CopyStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Done => "done",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyStatusRow {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub status: CopyStatus,
    pub checksum: Option<String>,
    /// Where the content lives at the destination; for a deduplicated file
    /// this is the copy or pool file that already held it.
    pub dest: Option<FileIdentity>,
    pub last_copy_attempt: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Planned,
    Keeper,
    Moved,
    Verified,
    Error,
}

string_enum!(MoveStatus {
    Planned => "planned",
    Keeper => "keeper",
    Moved => "moved",
    Verified => "verified",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovePlanEntry {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub checksum: String,
    pub move_to: Option<FileIdentity>,
    pub status: MoveStatus,
    pub error_message: Option<String>,
    pub is_keeper: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveHistoryEntry {
    pub id: i64,
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub attempted_at: i64,
    pub action: String,
    pub result: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    Shallow,
    Deep,
}

impl VerifyStage {
    pub fn table(self) -> &'static str {
        match self {
            VerifyStage::Shallow => "verification_shallow_results",
            VerifyStage::Deep => "verification_deep_results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    Mismatch,
    Missing,
    Failed,
    Error,
}

string_enum!(VerifyStatus {
    Ok => "ok",
    Mismatch => "mismatch",
    Missing => "missing",
    Failed => "failed",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShallowResult {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub exists: bool,
    pub size_matched: bool,
    pub last_modified_matched: bool,
    pub expected_size: Option<i64>,
    pub actual_size: Option<i64>,
    pub expected_last_modified: Option<i64>,
    pub actual_last_modified: Option<i64>,
    pub status: VerifyStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepResult {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub checksum_matched: bool,
    pub expected_checksum: Option<String>,
    pub src_checksum: Option<String>,
    pub dst_checksum: Option<String>,
    pub status: VerifyStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumCacheEntry {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub size: i64,
    pub last_modified: i64,
    pub checksum: String,
    pub imported_at: Option<i64>,
    pub last_validated: Option<i64>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareSide {
    Left,
    Right,
}

impl CompareSide {
    /// Table listing files present on the other side but missing here.
    pub fn missing_table(self) -> &'static str {
        match self {
            CompareSide::Left => "compare_results_left_missing",
            CompareSide::Right => "compare_results_right_missing",
        }
    }
}

/// A file whose content has no counterpart on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    #[serde(flatten)]
    pub identity: FileIdentity,
    pub size: i64,
    pub last_modified: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdenticalPair {
    pub left: FileIdentity,
    pub right: FileIdentity,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DifferentPair {
    pub pool_relative_path: String,
    pub left: FileIdentity,
    pub left_checksum: String,
    pub right: FileIdentity,
    pub right_checksum: String,
}

/// A row left outside a terminal success state, for the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemFile {
    pub uid: String,
    pub relative_path: String,
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub tool: String,
    pub command: String,
    pub options_json: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!("in_progress".parse::<CopyStatus>(), Ok(CopyStatus::InProgress));
        assert_eq!(MoveStatus::Keeper.as_str(), "keeper");
        assert!("bogus".parse::<VerifyStatus>().is_err());
    }
}
