use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use crate::error::Result;

/// Writes one block of an upload to its staging location.
#[async_trait]
pub trait RequestWriter: Send + Sync {
    async fn write_block(&self, staging_dir: &Path, block: u64, bytes: &[u8]) -> Result<()>;
}

/// Filesystem writer. Blocks are written create-or-truncate under their
/// block number, so re-sending an already-arrived block rewrites the same
/// bytes.
#[derive(Debug, Default)]
pub struct BlockRequestWriter;

#[async_trait]
impl RequestWriter for BlockRequestWriter {
    async fn write_block(&self, staging_dir: &Path, block: u64, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(staging_dir).await?;
        fs::write(staging_dir.join(block.to_string()), bytes).await?;
        Ok(())
    }
}
