use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database models for the depot catalog
///
/// The catalog records projects, their directory trees, committed files
/// and in-flight upload requests. Committed file content lives outside
/// the database in the content-addressed store; the catalog only holds
/// metadata and the checksum.

/// A user known to the repository. The `apikey` authenticates requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbUser {
    pub id: String,
    pub name: String,
    pub apikey: String,
    pub created_at: DateTime<Utc>,
}

/// A project. Directory paths inside a project always start with the
/// project name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbProject {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// A directory inside a project.
///
/// `path` is relative to the project root, forward-slash normalized.
/// `parent_id` is empty for the project root directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbDirectory {
    pub id: String,
    pub path: String,
    pub project_id: String,
    pub parent_id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// A catalog file entry.
///
/// A file becomes visible once `current` is set by the finisher. Within a
/// directory there is at most one current file per (name, checksum) pair;
/// the finisher enforces this by returning the existing entry instead of
/// committing a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbFile {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub size: i64,
    pub checksum: String,
    pub mtime: DateTime<Utc>,
    pub directory_id: String,
    pub project_id: String,
    pub current: bool,
    pub created_at: DateTime<Utc>,
}

/// A persistent upload request.
///
/// Created by the ID service, mutated by the upload service as blocks
/// arrive, deleted on successful assembly or explicit delete. The arrived
/// blocks are stored as a packed bitset so an interrupted upload can
/// resume after a server restart.
#[derive(Debug, Clone, PartialEq)]
pub struct DbUpload {
    pub id: String,
    pub owner: String,
    pub project_id: String,
    pub directory_id: String,
    pub filename: String,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    pub checksum: String,
    pub chunk_size: i64,
    pub host: String,
    pub num_blocks: i64,
    /// Packed little-endian bitset of arrived block numbers (1-based).
    pub blocks: Vec<u8>,
    /// True when the declared checksum already existed as a current file
    /// in the target directory at create time.
    pub is_existing: bool,
    /// True when the in-memory tracker was re-materialized from this row
    /// after a restart; the rolling hash is then unrecoverable and the
    /// assembler re-hashes the assembled file.
    pub server_restarted: bool,
    pub birthtime: DateTime<Utc>,
}

impl DbUpload {
    pub fn total_blocks(&self) -> u64 {
        self.num_blocks as u64
    }
}
