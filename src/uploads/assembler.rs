use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogChange, ChangePublisher, DbFile, DbUpload};
use crate::checksum::md5_file;
use crate::error::{Error, Result};
use crate::uploads::request_path::RequestPath;
use crate::uploads::tracker::BlockTracker;

/// Reassembles a completed upload and commits it to the catalog.
///
/// Runs while the caller still holds the upload's tracker mutex, so the
/// final block write and the assembly are one ordered critical section.
#[derive(Clone)]
pub struct Assembler {
    catalog: Catalog,
    tracker: Arc<BlockTracker>,
    paths: RequestPath,
    changes: ChangePublisher,
}

impl Assembler {
    pub fn new(
        catalog: Catalog,
        tracker: Arc<BlockTracker>,
        paths: RequestPath,
        changes: ChangePublisher,
    ) -> Self {
        Assembler {
            catalog,
            tracker,
            paths,
            changes,
        }
    }

    /// Assemble the staged blocks of `upload` into the content store and
    /// commit the resulting file. `tracker_hash` is the rolling checksum
    /// when it is trustworthy (in-order arrival, no restart).
    ///
    /// On failure the inserted catalog row is rolled back while the
    /// request and its staged blocks stay on disk, so the client can
    /// retry by re-sending a chunk.
    pub async fn assemble(
        &self,
        upload: &DbUpload,
        tracker_hash: Option<String>,
    ) -> Result<DbFile> {
        let file = DbFile {
            id: Uuid::new_v4().to_string(),
            name: upload.filename.clone(),
            owner: upload.owner.clone(),
            size: upload.size,
            checksum: String::new(),
            mtime: upload.mtime,
            directory_id: upload.directory_id.clone(),
            project_id: upload.project_id.clone(),
            current: false,
            created_at: Utc::now(),
        };
        self.catalog.insert_file(&file).await?;

        match self.move_and_finish(upload, &file, tracker_hash).await {
            Ok(committed) => {
                self.cleanup_request(&upload.id).await;
                info!(file = %committed.id, request = %upload.id, "assembled upload");
                Ok(committed)
            }
            Err(err) => {
                // Roll back the catalog row; the request stays resumable.
                if let Err(cleanup_err) = self.catalog.delete_file(&file.id).await {
                    warn!(
                        file = %file.id,
                        error = %cleanup_err,
                        "could not remove file row after failed assembly"
                    );
                }
                if !upload.is_existing {
                    let _ = fs::remove_file(self.paths.content_path(&file.id)).await;
                }
                Err(err)
            }
        }
    }

    async fn move_and_finish(
        &self,
        upload: &DbUpload,
        file: &DbFile,
        tracker_hash: Option<String>,
    ) -> Result<DbFile> {
        if !upload.is_existing {
            fs::create_dir_all(self.paths.content_dir(&file.id)).await?;
            let assembled = self.concatenate_blocks(upload).await?;
            move_into_place(&assembled, &self.paths.content_path(&file.id)).await?;
        }

        let checksum = self.determine_checksum(upload, &file.id, tracker_hash).await?;
        self.finish(upload, file, &checksum).await
    }

    /// Concatenate the staged blocks in block order into a scratch file
    /// next to them, and return its path.
    async fn concatenate_blocks(&self, upload: &DbUpload) -> Result<std::path::PathBuf> {
        let staging = self.paths.staging_dir(&upload.id);
        let assembled_path = staging.join("assembled");
        let out = fs::File::create(&assembled_path).await?;
        let mut writer = BufWriter::new(out);

        for block in 1..=upload.total_blocks() {
            let mut reader = fs::File::open(staging.join(block.to_string())).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(assembled_path)
    }

    /// Which checksum to record:
    /// known content keeps its declared checksum, a restarted upload is
    /// re-hashed from disk, and the common path uses the rolling hash.
    async fn determine_checksum(
        &self,
        upload: &DbUpload,
        file_id: &str,
        tracker_hash: Option<String>,
    ) -> Result<String> {
        if upload.is_existing {
            return Ok(upload.checksum.clone());
        }
        match tracker_hash {
            Some(hash) => Ok(hash),
            None => md5_file(&self.paths.content_path(file_id)).await,
        }
    }

    /// Commit phase: flip the file to current, unless an identical current
    /// file already lives in the directory, in which case the new one is
    /// discarded and the existing one returned.
    async fn finish(&self, upload: &DbUpload, file: &DbFile, checksum: &str) -> Result<DbFile> {
        if let Some(existing) = self
            .catalog
            .current_file_in_directory(&upload.directory_id, &file.name, checksum)
            .await?
        {
            info!(
                file = %existing.id,
                request = %upload.id,
                "duplicate content, reusing existing file"
            );
            self.catalog.delete_file(&file.id).await?;
            if !upload.is_existing {
                let _ = fs::remove_file(self.paths.content_path(&file.id)).await;
            }
            return Ok(existing);
        }

        self.catalog
            .commit_file(&file.id, checksum, upload.size, upload.mtime)
            .await?;
        self.changes.publish(CatalogChange::FileCommitted {
            file_id: file.id.clone(),
            directory_id: upload.directory_id.clone(),
            project_id: upload.project_id.clone(),
        });

        let mut committed = file.clone();
        committed.checksum = checksum.to_string();
        committed.current = true;
        Ok(committed)
    }

    /// Drop all state for a finished request: tracker entry, catalog row,
    /// staging directory.
    async fn cleanup_request(&self, upload_id: &str) {
        self.tracker.clear(upload_id).await;
        if let Err(err) = self.catalog.delete_upload(upload_id).await {
            warn!(request = %upload_id, error = %err, "could not delete upload request");
        }
        let _ = fs::remove_dir_all(self.paths.staging_dir(upload_id)).await;
    }
}

/// Move the assembled file into the content store. Rename is atomic on
/// one filesystem; when the store sits on another device the rename
/// fails and we fall back to copy, fsync, unlink.
async fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            match fs::copy(from, to).await {
                Ok(_) => {
                    let dest = fs::File::open(to).await?;
                    dest.sync_all().await?;
                    fs::remove_file(from).await?;
                    Ok(())
                }
                Err(_) => Err(Error::Internal(format!(
                    "could not move assembled file into place: {}",
                    rename_err
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_into_place_renames_within_one_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::write(&from, b"payload").await.unwrap();

        move_into_place(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).await.unwrap(), b"payload");
    }
}
