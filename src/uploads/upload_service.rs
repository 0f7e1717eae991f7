use std::sync::Arc;

use tracing::{debug, error};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::uploads::assembler::Assembler;
use crate::uploads::request_path::RequestPath;
use crate::uploads::request_writer::RequestWriter;
use crate::uploads::tracker::{BlockSet, BlockTracker};

/// One chunk of an upload, as delivered by the wire protocol.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    /// 1-based block number.
    pub chunk_number: u64,
    pub chunk_size: i64,
    pub total_chunks: u64,
    pub total_size: i64,
    pub filename: String,
    pub project_id: String,
    pub directory_id: String,
    pub chunk: Vec<u8>,
}

/// What the client learns from sending a chunk. `file_id` stays empty
/// until the final chunk completes the file.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadStatus {
    pub file_id: String,
    pub done: bool,
}

/// Accepts chunks, persists them, and triggers assembly once every block
/// of an upload has arrived.
#[derive(Clone)]
pub struct UploadService {
    catalog: Catalog,
    tracker: Arc<BlockTracker>,
    writer: Arc<dyn RequestWriter>,
    paths: RequestPath,
    assembler: Assembler,
}

impl UploadService {
    pub fn new(
        catalog: Catalog,
        tracker: Arc<BlockTracker>,
        writer: Arc<dyn RequestWriter>,
        paths: RequestPath,
        assembler: Assembler,
    ) -> Self {
        UploadService {
            catalog,
            tracker,
            writer,
            paths,
            assembler,
        }
    }

    /// Persist one chunk and, when it is the last missing one, assemble
    /// the file. Re-sends of already-arrived chunks are no-ops that still
    /// evaluate completion, so a client retry after a failed assembly
    /// re-triggers it.
    pub async fn upload(&self, req: &ChunkRequest) -> Result<UploadStatus> {
        let mut upload = self
            .catalog
            .upload_by_id(&req.upload_id)
            .await?
            .ok_or_else(|| Error::invalid(format!("unknown upload {}", req.upload_id)))?;

        // A known request with no live tracker entry means this process
        // restarted mid-upload. Rebuild the entry from the persisted
        // bitset; any progress made before the restart invalidates the
        // rolling hash, which is recorded so assembly re-hashes from disk.
        let entry = match self.tracker.entry(&req.upload_id).await {
            Some(entry) => entry,
            None => {
                let blocks = BlockSet::from_bytes(&upload.blocks, upload.total_blocks());
                let restarted = !blocks.none_set();
                if restarted && !upload.server_restarted {
                    self.catalog.mark_upload_restarted(&req.upload_id).await?;
                    upload.server_restarted = true;
                }
                self.tracker.load(&req.upload_id, blocks, restarted).await
            }
        };

        let mut entry = entry.lock().await;

        self.validate_chunk(req, upload.total_blocks(), upload.size, upload.chunk_size)?;

        if !entry.is_block_set(req.chunk_number) {
            // The wire contract is in-order delivery per upload id; that
            // is what keeps the rolling hash honest.
            let expected = entry.blocks().first_unset().unwrap_or(0);
            if req.chunk_number != expected {
                return Err(Error::invalid(format!(
                    "chunk {} out of order, expected {}",
                    req.chunk_number, expected
                )));
            }

            self.writer
                .write_block(
                    &self.paths.staging_dir(&req.upload_id),
                    req.chunk_number,
                    &req.chunk,
                )
                .await
                .map_err(|err| {
                    error!(
                        request = %req.upload_id,
                        block = req.chunk_number,
                        error = %err,
                        "writing block failed"
                    );
                    err
                })?;

            if !entry.server_restarted() {
                entry.add_to_hash(&req.chunk);
            }
            entry.set_block(req.chunk_number);
            self.catalog
                .update_upload_blocks(&req.upload_id, &entry.blocks().to_bytes())
                .await?;
        } else {
            debug!(
                request = %req.upload_id,
                block = req.chunk_number,
                "block already arrived, skipping write"
            );
        }

        if entry.done() {
            let hash_is_valid = !upload.server_restarted && !entry.server_restarted();
            let tracker_hash = hash_is_valid.then(|| entry.hash());
            let file = self.assembler.assemble(&upload, tracker_hash).await?;
            return Ok(UploadStatus {
                file_id: file.id,
                done: true,
            });
        }

        Ok(UploadStatus {
            file_id: String::new(),
            done: false,
        })
    }

    fn validate_chunk(
        &self,
        req: &ChunkRequest,
        total_blocks: u64,
        file_size: i64,
        chunk_size: i64,
    ) -> Result<()> {
        if req.chunk_number == 0 || req.chunk_number > total_blocks {
            return Err(Error::invalid(format!(
                "chunk number {} outside 1..={}",
                req.chunk_number, total_blocks
            )));
        }

        let expected_len = if req.chunk_number < total_blocks {
            chunk_size
        } else {
            file_size - (total_blocks as i64 - 1) * chunk_size
        };
        if req.chunk.len() as i64 != expected_len {
            return Err(Error::invalid(format!(
                "chunk {} carries {} bytes, expected {}",
                req.chunk_number,
                req.chunk.len(),
                expected_len
            )));
        }

        Ok(())
    }
}
