use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalog::{Catalog, DbUpload};
use crate::error::{Error, Result};
use crate::uploads::request_path::RequestPath;
use crate::uploads::tracker::{BlockSet, BlockTracker};

/// Everything needed to create (or resume) an upload request.
#[derive(Debug, Clone)]
pub struct IdRequest {
    pub user: String,
    pub project_id: String,
    pub directory_id: String,
    pub filename: String,
    pub file_size: i64,
    pub file_mtime: DateTime<Utc>,
    pub chunk_size: i64,
    pub checksum: String,
    pub host: String,
}

/// Result of a create: the stable request id and the next block the
/// client should send.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedUpload {
    pub id: String,
    pub starting_block: u64,
}

/// Assigns stable identifiers to upload requests and answers which block
/// a client should send next.
#[derive(Clone)]
pub struct IdService {
    catalog: Catalog,
    tracker: Arc<BlockTracker>,
    paths: RequestPath,
}

impl IdService {
    pub fn new(catalog: Catalog, tracker: Arc<BlockTracker>, paths: RequestPath) -> Self {
        IdService {
            catalog,
            tracker,
            paths,
        }
    }

    /// Create a new upload request, or resume the existing one matching
    /// the natural key (project, directory, filename, size, checksum).
    pub async fn create(&self, req: IdRequest) -> Result<CreatedUpload> {
        self.validate(&req).await?;

        if let Some(existing) = self
            .catalog
            .upload_by_natural_key(
                &req.project_id,
                &req.directory_id,
                &req.filename,
                req.file_size,
                &req.checksum,
            )
            .await?
        {
            let blocks = BlockSet::from_bytes(&existing.blocks, existing.total_blocks());
            // Only re-install the tracker when no progress has been made;
            // a populated bitset without a live entry means the rolling
            // hash is gone, which the upload path detects and records.
            if blocks.none_set() && !self.tracker.exists(&existing.id).await {
                self.tracker.load(&existing.id, blocks.clone(), false).await;
            }
            return Ok(CreatedUpload {
                starting_block: find_starting_block(&blocks),
                id: existing.id,
            });
        }

        // No request in flight. If the directory already holds a current
        // file with this name and checksum the upload is a re-send of
        // known content.
        let is_existing = self
            .catalog
            .current_file_in_directory(&req.directory_id, &req.filename, &req.checksum)
            .await?
            .is_some();

        let num_blocks = count_blocks(req.file_size, req.chunk_size);
        let blocks = BlockSet::new(num_blocks);
        let upload = DbUpload {
            id: Uuid::new_v4().to_string(),
            owner: req.user.clone(),
            project_id: req.project_id.clone(),
            directory_id: req.directory_id.clone(),
            filename: req.filename.clone(),
            size: req.file_size,
            mtime: req.file_mtime,
            checksum: req.checksum.clone(),
            chunk_size: req.chunk_size,
            host: req.host.clone(),
            num_blocks: num_blocks as i64,
            blocks: blocks.to_bytes(),
            is_existing,
            server_restarted: false,
            birthtime: Utc::now(),
        };
        self.catalog.insert_upload(&upload).await?;
        self.tracker.load(&upload.id, blocks.clone(), false).await;

        info!(
            request = %upload.id,
            file = %upload.filename,
            blocks = num_blocks,
            is_existing,
            "created upload request"
        );

        Ok(CreatedUpload {
            starting_block: find_starting_block(&blocks),
            id: upload.id,
        })
    }

    /// Delete an upload request. Only the request owner or the project
    /// owner may do this.
    pub async fn delete(&self, upload_id: &str, user: &str) -> Result<()> {
        let upload = self
            .catalog
            .upload_by_id(upload_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("upload {}", upload_id)))?;

        let project = self
            .catalog
            .project_by_id(&upload.project_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {}", upload.project_id)))?;

        if upload.owner != user && project.owner != user {
            return Err(Error::NoAccess);
        }

        self.catalog.delete_upload(upload_id).await?;
        self.tracker.clear(upload_id).await;
        let _ = fs::remove_dir_all(self.paths.staging_dir(upload_id)).await;

        Ok(())
    }

    /// Upload requests outstanding for a project the user may access.
    pub async fn list(&self, project_id: &str, user: &str) -> Result<Vec<DbUpload>> {
        self.catalog
            .project_by_id(project_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {}", project_id)))?;

        if !self.catalog.user_has_access(project_id, user).await? {
            return Err(Error::NoAccess);
        }

        self.catalog.uploads_for_project(project_id).await
    }

    async fn validate(&self, req: &IdRequest) -> Result<()> {
        if req.filename.is_empty() {
            return Err(Error::invalid("filename cannot be empty"));
        }
        if req.file_size < 0 {
            return Err(Error::invalid("file size cannot be negative"));
        }
        if req.chunk_size < 1 {
            return Err(Error::invalid("chunk size must be at least 1"));
        }
        if req.checksum.is_empty() {
            return Err(Error::invalid("checksum cannot be empty"));
        }

        let dir = self
            .catalog
            .directory_by_id(&req.directory_id)
            .await?
            .ok_or_else(|| {
                Error::invalid(format!("unknown directory {}", req.directory_id))
            })?;
        if dir.project_id != req.project_id {
            return Err(Error::invalid(format!(
                "directory {} does not belong to project {}",
                req.directory_id, req.project_id
            )));
        }

        Ok(())
    }
}

pub(crate) fn count_blocks(file_size: i64, chunk_size: i64) -> u64 {
    (file_size as u64).div_ceil(chunk_size as u64)
}

/// The smallest unset block number, 1-based. Blocks arrive starting at 1,
/// so an untouched request reports 1. A fully set bitset cannot happen
/// before assembly (assembly deletes the request); if it shows up anyway
/// we log it and tell the client to start over at 1, whose re-send will
/// re-run the completion check.
pub(crate) fn find_starting_block(blocks: &BlockSet) -> u64 {
    match blocks.first_unset() {
        Some(block) => block,
        None if blocks.num_blocks() == 0 => 1,
        None => {
            error!("upload request has every block set but was never assembled");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_block_is_one_for_an_empty_bitset() {
        assert_eq!(find_starting_block(&BlockSet::new(4)), 1);
    }

    #[test]
    fn starting_block_is_the_first_gap() {
        let mut blocks = BlockSet::new(4);
        blocks.set(1);
        assert_eq!(find_starting_block(&blocks), 2);

        blocks.set(2);
        blocks.set(3);
        assert_eq!(find_starting_block(&blocks), 4);
    }

    #[test]
    fn starting_block_counts_leading_arrivals_not_total() {
        let mut blocks = BlockSet::new(6);
        blocks.set(1);
        blocks.set(5);
        assert_eq!(find_starting_block(&blocks), 2);
    }

    #[test]
    fn block_counting_rounds_up() {
        assert_eq!(count_blocks(4, 2), 2);
        assert_eq!(count_blocks(5, 2), 3);
        assert_eq!(count_blocks(1, 1024 * 1024), 1);
        assert_eq!(count_blocks(0, 2), 0);
    }
}
